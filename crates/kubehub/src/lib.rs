//! Tally kubehub: capability discovery, resource watchers and their supervisor.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    Client,
};
use tally_core::{BootstrapError, ResourceHandler, ResourceSchema, SyncConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod informer;
pub mod paged;
pub mod source;
mod supervisor;

pub use informer::InformerWatcher;
pub use paged::{Backoff, PagedWatcher, Phase};
pub use source::{EventStream, KubeSource, ListPage, ListWatchSource, ResourceEvent};
pub use supervisor::{ResyncTrigger, WatchSupervisor};

/// Which watcher implementation backs every schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Full local cache through the kube runtime.
    Informer,
    /// Paged list followed by a bare watch; keeps only the cursor.
    Paged,
}

impl WatchMode {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        if cfg.no_cache_watch { WatchMode::Paged } else { WatchMode::Informer }
    }
}

/// A long-running producer of raw objects for one schema.
#[async_trait::async_trait]
pub trait ResourceWatcher: Send {
    fn schema(&self) -> &ResourceSchema;

    /// Drive the watcher until `cancel` fires.
    async fn run(self: Box<Self>, cancel: CancellationToken);
}

/// Build the watcher for one discovered resource.
pub fn build_watcher(
    mode: WatchMode,
    client: Client,
    schema: ResourceSchema,
    ar: ApiResource,
    handler: Arc<dyn ResourceHandler>,
    cfg: &SyncConfig,
    resync: watch::Receiver<u64>,
) -> Box<dyn ResourceWatcher> {
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    match mode {
        WatchMode::Informer => Box::new(InformerWatcher::new(schema, api, ar, handler, cfg).with_resync(resync)),
        WatchMode::Paged => {
            let timeout = cfg.watch_timeout.map(|t| u32::try_from(t.as_secs()).unwrap_or(u32::MAX));
            let source = KubeSource::new(api, ar, timeout);
            Box::new(PagedWatcher::new(schema, source, handler, cfg).with_resync(resync))
        }
    }
}

/// Resolve each schema against what the API server serves. Schemas the
/// server does not serve are skipped with a log line.
pub async fn enabled_resources(client: Client, schemas: &[ResourceSchema]) -> Result<Vec<(ResourceSchema, ApiResource)>, BootstrapError> {
    let groups: BTreeSet<&str> = schemas.iter().map(|s| s.group.as_str()).collect();
    let groups: Vec<&str> = groups.into_iter().collect();
    let discovery = Discovery::new(client)
        .filter(&groups)
        .run()
        .await
        .map_err(|e| BootstrapError::Discovery(e.to_string()))?;

    let mut out = Vec::with_capacity(schemas.len());
    for schema in schemas {
        let found = discovery
            .groups()
            .filter(|g| g.name() == schema.group)
            .flat_map(|g| g.versioned_resources(&schema.version))
            .find(|(ar, _)| ar.plural == schema.resource);
        match found {
            Some((ar, _caps)) => out.push((schema.clone(), ar)),
            None => info!(gvr = %schema, "resource not served by the cluster; skipping"),
        }
    }
    info!(requested = schemas.len(), enabled = out.len(), "capability discovery complete");
    Ok(out)
}
