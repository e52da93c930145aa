//! Tally core types: schemas, normalized records, the handler seam and config.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod normalize;

pub use normalize::{MalformedResource, Normalizer, PayloadMode};

/// A raw cluster object as returned by the orchestration API.
pub type RawResource = serde_json::Value;

/// One watched kind, addressed the way the list/watch endpoints address it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceSchema {
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
}

impl ResourceSchema {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }

    /// `group/version` as used in `apiVersion` (`v1` for the core group).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Reject schemas that cannot address anything on the API server.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.version.is_empty() {
            return Err(SchemaError { key: self.to_string(), reason: "empty version" });
        }
        if self.resource.is_empty() {
            return Err(SchemaError { key: self.to_string(), reason: "empty resource" });
        }
        Ok(())
    }
}

impl fmt::Display for ResourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl FromStr for ResourceSchema {
    type Err = SchemaError;

    /// Parse `v1/pods` or `apps/v1/deployments`.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.trim().split('/').collect();
        let schema = match parts.as_slice() {
            [version, resource] => Self::new("", version, resource),
            [group, version, resource] => Self::new(group, version, resource),
            _ => return Err(SchemaError { key: key.to_string(), reason: "expected version/resource or group/version/resource" }),
        };
        schema.validate()?;
        Ok(schema)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource schema {key:?}: {reason}")]
pub struct SchemaError {
    pub key: String,
    pub reason: &'static str,
}

/// Failures that make it unsafe to start forwarding at all.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("fetching remote hash list: {0}")]
    HashList(String),
    #[error("capability discovery: {0}")]
    Discovery(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// What the remote inventory should do with a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity attached to every forwarded record so the remote side can scope its inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct OwnerTag {
    pub scope: String,
    pub subject: String,
}

impl OwnerTag {
    pub fn cluster(cluster_id: &str) -> Self {
        Self { scope: "cluster".to_string(), subject: cluster_id.to_string() }
    }
}

/// A raw object reduced to what the inventory stores, with its change fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResource {
    pub identifier: String,
    pub api_version: String,
    pub kind: String,
    pub content_hash: String,
    pub owner: OwnerTag,
    /// Object with volatile fields removed. `Null` for synthesized deletes.
    pub payload: serde_json::Value,
}

impl NormalizedResource {
    /// Identifier-only record, used when the sweep deletes something it never saw.
    pub fn tombstone(identifier: &str, owner: OwnerTag) -> Self {
        Self {
            identifier: identifier.to_string(),
            api_version: String::new(),
            kind: String::new(),
            content_hash: String::new(),
            owner,
            payload: serde_json::Value::Null,
        }
    }
}

/// One resource the remote side believes exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashListEntry {
    pub identifier: String,
    pub hash: String,
    pub active: bool,
}

/// Downstream of every watcher: receives raw objects tagged with the action they represent.
#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn handle(&self, action: Action, raw: RawResource);
}

/// Tunables consumed by the watchers and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Paged list+watch instead of the caching informer.
    pub no_cache_watch: bool,
    pub page_size: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Server-side timeout for a single watch request; the API server picks
    /// one when `None`.
    pub watch_timeout: Option<Duration>,
    pub retry_flush_interval: Duration,
    /// Delay from startup until the first cleanup deadline.
    pub cleanup_first_delay: Duration,
    pub cleanup_period: Duration,
    /// Periodic cache statistics; disabled when `None`.
    pub cache_stats_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            no_cache_watch: true,
            page_size: 500,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            watch_timeout: None,
            retry_flush_interval: Duration::from_secs(10),
            cleanup_first_delay: Duration::from_secs(60),
            cleanup_period: Duration::from_secs(24 * 60 * 60),
            cache_stats_interval: None,
        }
    }
}

pub mod prelude {
    pub use super::{
        Action, BootstrapError, HashListEntry, MalformedResource, NormalizedResource, Normalizer, OwnerTag, PayloadMode, RawResource,
        ResourceHandler, ResourceSchema, SyncConfig,
    };
}
