//! The list/watch boundary the paged watcher drives, and its kube implementation.

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, TypeMeta},
};
use tally_core::RawResource;

/// One change-stream event. `Error` means the server gave up on the cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Added(RawResource),
    Modified(RawResource),
    Deleted(RawResource),
    Bookmark { resource_version: String },
    Error { code: u16, message: String },
}

/// One page of a paged list.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<RawResource>,
    /// Cursor to resume a watch from once the last page is in.
    pub resource_version: String,
    pub continue_token: Option<String>,
}

pub type EventStream = BoxStream<'static, Result<ResourceEvent>>;

#[async_trait::async_trait]
pub trait ListWatchSource: Send + Sync {
    async fn list_page(&self, limit: u32, continue_token: Option<&str>) -> Result<ListPage>;

    /// Open a change stream starting after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<EventStream>;
}

/// `ListWatchSource` over the dynamic API for one resource.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    ar: ApiResource,
    timeout_secs: Option<u32>,
}

impl KubeSource {
    pub fn new(api: Api<DynamicObject>, ar: ApiResource, timeout_secs: Option<u32>) -> Self {
        // the API server rejects watch timeouts of 295s and above
        Self { api, ar, timeout_secs: timeout_secs.map(|t| t.clamp(1, 290)) }
    }
}

#[async_trait::async_trait]
impl ListWatchSource for KubeSource {
    async fn list_page(&self, limit: u32, continue_token: Option<&str>) -> Result<ListPage> {
        let mut lp = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        let list = self.api.list(&lp).await.context("listing objects")?;
        let items = list.items.into_iter().map(|o| to_raw(o, &self.ar)).collect::<Result<Vec<_>>>()?;
        Ok(ListPage {
            items,
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream> {
        // bookmarks are requested by default
        let mut wp = WatchParams::default();
        if let Some(secs) = self.timeout_secs {
            wp = wp.timeout(secs);
        }
        let stream = self.api.watch(&wp, resource_version).await.context("opening watch")?;
        let ar = self.ar.clone();
        Ok(stream
            .map(move |ev| -> Result<ResourceEvent> {
                let ev = ev.context("watch stream")?;
                Ok(match ev {
                    WatchEvent::Added(o) => ResourceEvent::Added(to_raw(o, &ar)?),
                    WatchEvent::Modified(o) => ResourceEvent::Modified(to_raw(o, &ar)?),
                    WatchEvent::Deleted(o) => ResourceEvent::Deleted(to_raw(o, &ar)?),
                    WatchEvent::Bookmark(b) => ResourceEvent::Bookmark { resource_version: b.metadata.resource_version },
                    WatchEvent::Error(e) => ResourceEvent::Error { code: e.code, message: e.message },
                })
            })
            .boxed())
    }
}

/// Serialize an object, filling in apiVersion/kind which list responses omit per item.
pub(crate) fn to_raw(mut obj: DynamicObject, ar: &ApiResource) -> Result<RawResource> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    serde_json::to_value(&obj).context("serializing DynamicObject")
}
