//! Owns every watcher task and the shared resync epoch.

use std::sync::Arc;

use kube::Client;
use tally_core::{BootstrapError, ResourceHandler, ResourceSchema, SyncConfig};
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{build_watcher, enabled_resources, ResourceWatcher, WatchMode};

/// Cloneable handle that asks every watcher to start over from a full list.
#[derive(Clone)]
pub struct ResyncTrigger(Arc<watch::Sender<u64>>);

impl ResyncTrigger {
    pub fn trigger(&self) {
        self.0.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    pub fn epoch(&self) -> u64 { *self.0.borrow() }
}

pub struct WatchSupervisor {
    cancel: CancellationToken,
    resync: Arc<watch::Sender<u64>>,
    tasks: JoinSet<()>,
}

impl Default for WatchSupervisor {
    fn default() -> Self { Self::new(CancellationToken::new()) }
}

impl WatchSupervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { cancel, resync: Arc::new(tx), tasks: JoinSet::new() }
    }

    /// Validate schemas, run discovery, and start one watcher per served resource.
    pub async fn start(
        &mut self,
        client: Client,
        schemas: &[ResourceSchema],
        handler: Arc<dyn ResourceHandler>,
        cfg: &SyncConfig,
    ) -> Result<usize, BootstrapError> {
        for schema in schemas {
            schema.validate()?;
        }
        let mode = WatchMode::from_config(cfg);
        let resources = enabled_resources(client.clone(), schemas).await?;
        for (schema, ar) in resources {
            let watcher = build_watcher(mode, client.clone(), schema, ar, handler.clone(), cfg, self.subscribe());
            self.spawn(watcher);
        }
        info!(watchers = self.tasks.len(), mode = ?mode, "watchers started");
        Ok(self.tasks.len())
    }

    /// Run an already built watcher under this supervisor's cancel token.
    pub fn spawn(&mut self, watcher: Box<dyn ResourceWatcher>) {
        let cancel = self.cancel.child_token();
        self.tasks.spawn(watcher.run(cancel));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.resync.subscribe() }

    pub fn resync_trigger(&self) -> ResyncTrigger { ResyncTrigger(self.resync.clone()) }

    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    pub fn len(&self) -> usize { self.tasks.len() }

    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    /// Cancel every watcher and wait for all of them to return.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "watcher task failed");
            }
        }
        info!("all watchers stopped");
    }
}
