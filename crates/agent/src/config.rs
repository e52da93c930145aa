use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use clap::{ArgAction, Parser};
use tally_core::{catalog, OwnerTag, ResourceSchema, SyncConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "tally-agent", version, about = "Forward cluster resources to the remote inventory")]
pub struct Cli {
    /// Remote inventory base URL
    #[arg(long, env = "TALLY_API_URL")]
    pub api_url: String,

    #[arg(long, env = "TALLY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Owner subject attached to every record, usually the cluster id
    #[arg(long, env = "TALLY_CLUSTER_ID")]
    pub cluster_id: String,

    #[arg(long, env = "TALLY_OWNER_SCOPE", default_value = "cluster")]
    pub owner_scope: String,

    /// Watched resources as group/version/resource (v1/pods for the core group); built-in catalog when empty
    #[arg(long, env = "TALLY_SCHEMAS", value_delimiter = ',')]
    pub schemas: Vec<String>,

    /// Paged list+watch that keeps no object cache; `false` uses the caching informer
    #[arg(long, env = "TALLY_NO_CACHE_WATCH", action = ArgAction::Set, default_value_t = true)]
    pub no_cache_watch: bool,

    #[arg(long, env = "TALLY_PAGE_SIZE", default_value_t = 500)]
    pub page_size: u32,

    /// Server-side watch timeout; left to the API server when unset
    #[arg(long, env = "TALLY_WATCH_TIMEOUT_SECS")]
    pub watch_timeout_secs: Option<u64>,

    #[arg(long, env = "TALLY_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "TALLY_RETRY_FLUSH_SECS", default_value_t = 10)]
    pub retry_flush_secs: u64,

    /// Local time of day (HH:MM:SS) for the daily cleanup; otherwise it first runs after --cleanup-delay-secs
    #[arg(long, env = "TALLY_CLEANUP_AT")]
    pub cleanup_at: Option<String>,

    #[arg(long, env = "TALLY_CLEANUP_DELAY_SECS", default_value_t = 60)]
    pub cleanup_delay_secs: u64,

    /// Log cache statistics at this interval
    #[arg(long, env = "TALLY_CACHE_STATS")]
    pub cache_stats_secs: Option<u64>,
}

impl Cli {
    pub fn owner(&self) -> OwnerTag { OwnerTag { scope: self.owner_scope.clone(), subject: self.cluster_id.clone() } }

    /// Configured schemas, or the catalog. A malformed key is fatal.
    pub fn resource_schemas(&self) -> Result<Vec<ResourceSchema>> {
        let keys: Vec<&str> = self.schemas.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if keys.is_empty() {
            return Ok(catalog::default_schemas());
        }
        keys.into_iter().map(|k| k.parse::<ResourceSchema>().context("parsing --schemas")).collect()
    }

    pub fn sync_config(&self, now: DateTime<Local>) -> Result<SyncConfig> {
        let cleanup_first_delay = match &self.cleanup_at {
            Some(at) => until_time_of_day(now, at)?,
            None => Duration::from_secs(self.cleanup_delay_secs),
        };
        Ok(SyncConfig {
            no_cache_watch: self.no_cache_watch,
            page_size: self.page_size,
            watch_timeout: self.watch_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
            retry_flush_interval: Duration::from_secs(self.retry_flush_secs.max(1)),
            cleanup_first_delay,
            cache_stats_interval: self.cache_stats_secs.filter(|s| *s > 0).map(Duration::from_secs),
            ..SyncConfig::default()
        })
    }
}

/// Time from `now` until the next local occurrence of `at` (`HH:MM:SS`).
pub fn until_time_of_day<Tz: TimeZone>(now: DateTime<Tz>, at: &str) -> Result<Duration> {
    let t = NaiveTime::parse_from_str(at.trim(), "%H:%M:%S").with_context(|| format!("invalid cleanup time {at:?}, expected HH:MM:SS"))?;
    let tz = now.timezone();
    let mut day = now.date_naive();
    for _ in 0..3 {
        // skips days where the wall time does not exist (DST gap)
        if let Some(next) = tz.from_local_datetime(&day.and_time(t)).earliest() {
            if next > now {
                return (next - now.clone()).to_std().context("cleanup time out of range");
            }
        }
        day = day.succ_opt().context("date overflow")?;
    }
    anyhow::bail!("no upcoming local time {at}")
}
