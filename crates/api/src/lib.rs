//! Tally remote inventory boundary.
//!
//! [`InventoryApi`] is the raw transport (create/update/delete/hash list).
//! [`SyncClient`] sits on top of it and turns every outcome into either
//! success or a retryable [`SyncError`].

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::{Action, BootstrapError, NormalizedResource, OwnerTag};
use tracing::{debug, info, warn};

mod http;
mod mock;

pub use http::HttpInventory;
pub use mock::{MockCall, MockInventory};

/// Body of every create/update/delete request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    pub owner: OwnerTag,
    pub api_version: String,
    pub kind: String,
    pub uid: String,
    pub action: Action,
    pub hash: String,
    pub resource: serde_json::Value,
}

impl ResourceUpdate {
    pub fn new(action: Action, res: &NormalizedResource) -> Self {
        Self {
            owner: res.owner.clone(),
            api_version: res.api_version.clone(),
            kind: res.kind.clone(),
            uid: res.identifier.clone(),
            action,
            hash: res.content_hash.clone(),
            resource: res.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashItem {
    pub uid: String,
    pub hash: String,
}

/// What the remote side believes exists for one owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HashList {
    #[serde(default)]
    pub items: Vec<HashItem>,
}

/// Remote inventory transport. Mutations return the HTTP status code; a
/// transport-level failure is an `Err`.
#[async_trait::async_trait]
pub trait InventoryApi: Send + Sync {
    async fn create(&self, update: &ResourceUpdate) -> anyhow::Result<u16>;
    async fn update(&self, update: &ResourceUpdate) -> anyhow::Result<u16>;
    async fn delete(&self, update: &ResourceUpdate) -> anyhow::Result<u16>;
    async fn hash_list(&self, owner: &OwnerTag) -> anyhow::Result<HashList>;
}

/// Every failure is retryable; the variants only exist for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("remote returned status {0}")]
    Status(u16),
}

/// Dispatches normalized records to the inventory and keeps the
/// consecutive-error counter.
pub struct SyncClient {
    api: Arc<dyn InventoryApi>,
    consecutive_errors: AtomicU64,
}

impl SyncClient {
    pub fn new(api: Arc<dyn InventoryApi>) -> Self { Self { api, consecutive_errors: AtomicU64::new(0) } }

    /// Forward one record. Deletes address the identifier only.
    pub async fn send(&self, action: Action, res: &NormalizedResource) -> Result<(), SyncError> {
        let update = ResourceUpdate::new(action, res);
        let outcome = match action {
            Action::Create => self.api.create(&update).await,
            Action::Update => self.api.update(&update).await,
            Action::Delete => self.api.delete(&update).await,
        };
        let result = match outcome {
            Ok(status) if (200..300).contains(&status) => Ok(()),
            Ok(status) => Err(SyncError::Status(status)),
            Err(e) => Err(SyncError::Transport(format!("{e:#}"))),
        };

        match &result {
            Ok(()) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                metrics::counter!("sync_send_total", 1u64, "action" => action.as_str(), "outcome" => "ok");
                metrics::gauge!("sync_consecutive_errors", 0.0);
                debug!(action = %action, kind = %res.kind, api_version = %res.api_version, uid = %res.identifier, "update sent");
            }
            Err(e) => {
                let n = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("sync_send_total", 1u64, "action" => action.as_str(), "outcome" => "error");
                metrics::gauge!("sync_consecutive_errors", n as f64);
                warn!(action = %action, uid = %res.identifier, error = %e, error_count = n, "could not send update");
            }
        }
        result
    }

    /// Bootstrap call: identifier -> hash for everything owned by `owner`.
    pub async fn remote_hash_list(&self, owner: &OwnerTag) -> Result<HashMap<String, String>, BootstrapError> {
        let list = self.api.hash_list(owner).await.map_err(|e| BootstrapError::HashList(format!("{e:#}")))?;
        let map: HashMap<String, String> =
            list.items.into_iter().filter(|i| !i.uid.is_empty()).map(|i| (i.uid, i.hash)).collect();
        info!(length = map.len(), owner = %owner.subject, "got hash list from inventory");
        Ok(map)
    }

    /// Failed sends since the last success.
    pub fn error_count(&self) -> u64 { self.consecutive_errors.load(Ordering::Relaxed) }
}
