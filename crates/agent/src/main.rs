#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tally_api::{HttpInventory, SyncClient};
use tally_kubehub::WatchSupervisor;
use tally_store::{ChangeCache, RetryQueue};
use tally_sync::{CacheStatsJob, CleanupJob, Forwarder, PeriodicScheduler, RetryFlushJob, Schedule};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Cli;

fn init_tracing() {
    let env = std::env::var("TALLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TALLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TALLY_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; waiting for ctrl-c only"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cfg = cli.sync_config(chrono::Local::now())?;
    let schemas = cli.resource_schemas()?;
    let owner = cli.owner();
    info!(owner = %owner.subject, schemas = schemas.len(), no_cache = cfg.no_cache_watch, "starting tally agent");

    let http = HttpInventory::new(&cli.api_url, cli.api_key.clone(), Duration::from_secs(cli.http_timeout_secs))?;
    let client = Arc::new(SyncClient::new(Arc::new(http)));

    // nothing may be forwarded before the cache reflects the remote inventory
    let remote = client.remote_hash_list(&owner).await.context("bootstrapping change cache")?;
    let cache = Arc::new(ChangeCache::new());
    cache.init(remote);
    // the startup list marks everything still alive for the first sweep
    cache.start_cleanup_window();
    let retry = Arc::new(RetryQueue::new());
    let forwarder = Arc::new(Forwarder::new(owner.clone(), cache.clone(), retry.clone(), client.clone()));

    let kube = kube::Client::try_default().await.context("building kube client")?;
    let cancel = CancellationToken::new();
    let mut supervisor = WatchSupervisor::new(cancel.child_token());
    let resync = supervisor.resync_trigger();

    let mut sched = PeriodicScheduler::new(cancel.child_token());
    sched.every(cfg.retry_flush_interval, Arc::new(RetryFlushJob::new(forwarder.clone())));
    let cleanup = CleanupJob::new(cache.clone(), client.clone(), owner).on_window_open(move || resync.trigger());
    sched.add(Schedule::After { first: cfg.cleanup_first_delay, period: cfg.cleanup_period }, Arc::new(cleanup));
    if let Some(every) = cfg.cache_stats_interval {
        sched.every(every, Arc::new(CacheStatsJob::new(cache.clone(), retry.clone())));
    }
    info!(first_cleanup_in_secs = cfg.cleanup_first_delay.as_secs(), "cleanup scheduled");
    let sched_handle = sched.spawn();

    if let Err(e) = supervisor.start(kube, &schemas, forwarder, &cfg).await {
        error!(error = %e, "watcher bootstrap failed");
        cancel.cancel();
        let _ = sched_handle.await;
        return Err(e).context("starting watchers");
    }

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();
    supervisor.shutdown().await;
    if let Err(e) = sched_handle.await {
        warn!(error = %e, "scheduler task failed");
    }
    info!(queued_retries = retry.item_count(), cached = cache.len(), "tally agent stopped");
    Ok(())
}
