//! Caching watcher built on the kube runtime.
//!
//! Keeps a full local copy of every object, which lets it tell creations
//! from updates and notice objects that vanished while the stream was down.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
};
use tally_core::{Action, ResourceHandler, ResourceSchema, SyncConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paged::resync_requested;
use crate::source::to_raw;
use crate::ResourceWatcher;

pub struct InformerWatcher {
    schema: ResourceSchema,
    api: Api<DynamicObject>,
    ar: ApiResource,
    handler: Arc<dyn ResourceHandler>,
    page_size: u32,
    resync: Option<watch::Receiver<u64>>,
}

impl InformerWatcher {
    pub fn new(schema: ResourceSchema, api: Api<DynamicObject>, ar: ApiResource, handler: Arc<dyn ResourceHandler>, cfg: &SyncConfig) -> Self {
        Self { schema, api, ar, handler, page_size: cfg.page_size.max(1), resync: None }
    }

    pub fn with_resync(mut self, rx: watch::Receiver<u64>) -> Self {
        self.resync = Some(rx);
        self
    }

    async fn dispatch(&self, changes: Vec<(Action, DynamicObject)>) {
        for (action, obj) in changes {
            match to_raw(obj, &self.ar) {
                Ok(raw) => self.handler.handle(action, raw).await,
                Err(e) => warn!(gvr = %self.schema, error = %format!("{e:#}"), "dropping unserializable object"),
            }
        }
    }
}

/// Turn one watcher event into forwarded actions, judged against the store
/// as it was before the event is applied.
pub(crate) fn classify(store: &Store<DynamicObject>, ar: &ApiResource, event: &Event<DynamicObject>) -> Vec<(Action, DynamicObject)> {
    let known = |o: &DynamicObject| store.get(&ObjectRef::from_obj_with(o, ar.clone())).is_some();
    match event {
        Event::Applied(o) => {
            let action = if known(o) { Action::Update } else { Action::Create };
            vec![(action, o.clone())]
        }
        Event::Deleted(o) => vec![(Action::Delete, o.clone())],
        Event::Restarted(list) => {
            let mut out: Vec<(Action, DynamicObject)> = list
                .iter()
                .map(|o| (if known(o) { Action::Update } else { Action::Create }, o.clone()))
                .collect();
            let listed: HashSet<&str> = list.iter().filter_map(|o| o.metadata.uid.as_deref()).collect();
            for cached in store.state() {
                let gone = cached.metadata.uid.as_deref().map_or(false, |uid| !listed.contains(uid));
                if gone {
                    out.push((Action::Delete, (*cached).clone()));
                }
            }
            out
        }
    }
}

#[async_trait::async_trait]
impl ResourceWatcher for InformerWatcher {
    fn schema(&self) -> &ResourceSchema { &self.schema }

    async fn run(mut self: Box<Self>, cancel: CancellationToken) {
        let mut writer: Writer<DynamicObject> = Writer::new(self.ar.clone());
        let store = writer.as_reader();
        info!(gvr = %self.schema, "informer started");
        let mut synced = false;

        'restart: loop {
            let cfg = watcher::Config::default().page_size(self.page_size);
            let mut stream = watcher::watcher(self.api.clone(), cfg).default_backoff().boxed();
            let mut resync = self.resync.take();
            // the fresh stream relists, covering every resync requested so far
            if let Some(rx) = resync.as_mut() {
                rx.borrow_and_update();
            }
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'restart,
                    _ = resync_requested(&mut resync) => {
                        debug!(gvr = %self.schema, "resync requested; restarting informer stream");
                        self.resync = resync;
                        continue 'restart;
                    }
                    ev = stream.next() => ev,
                };
                match next {
                    Some(Ok(event)) => {
                        let changes = classify(&store, &self.ar, &event);
                        writer.apply_watcher_event(&event);
                        if let Event::Restarted(list) = &event {
                            if !synced {
                                synced = true;
                                info!(gvr = %self.schema, objects = list.len(), "informer synced");
                            }
                        }
                        self.dispatch(changes).await;
                    }
                    Some(Err(e)) => {
                        warn!(gvr = %self.schema, error = %e, "informer watch error");
                    }
                    None => {
                        warn!(gvr = %self.schema, "informer stream ended; restarting");
                        self.resync = resync;
                        continue 'restart;
                    }
                }
            }
        }
        info!(gvr = %self.schema, cached = store.state().len(), "informer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;

    fn ar() -> ApiResource { ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap")) }

    fn obj(name: &str, uid: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &ar()).within("default");
        o.metadata.uid = Some(uid.to_string());
        o
    }

    fn actions(changes: &[(Action, DynamicObject)]) -> Vec<(Action, String)> {
        changes.iter().map(|(a, o)| (*a, o.metadata.uid.clone().unwrap_or_default())).collect()
    }

    #[test]
    fn applied_is_create_then_update() {
        let ar = ar();
        let mut writer: Writer<DynamicObject> = Writer::new(ar.clone());
        let store = writer.as_reader();

        let first = Event::Applied(obj("a", "u-a"));
        assert_eq!(actions(&classify(&store, &ar, &first)), vec![(Action::Create, "u-a".into())]);
        writer.apply_watcher_event(&first);

        let second = Event::Applied(obj("a", "u-a"));
        assert_eq!(actions(&classify(&store, &ar, &second)), vec![(Action::Update, "u-a".into())]);
    }

    #[test]
    fn deleted_is_delete() {
        let ar = ar();
        let writer: Writer<DynamicObject> = Writer::new(ar.clone());
        let store = writer.as_reader();
        let ev = Event::Deleted(obj("a", "u-a"));
        assert_eq!(actions(&classify(&store, &ar, &ev)), vec![(Action::Delete, "u-a".into())]);
    }

    #[test]
    fn restart_reports_vanished_objects_as_deletes() {
        let ar = ar();
        let mut writer: Writer<DynamicObject> = Writer::new(ar.clone());
        let store = writer.as_reader();
        writer.apply_watcher_event(&Event::Restarted(vec![obj("a", "u-a"), obj("b", "u-b")]));

        let relist = Event::Restarted(vec![obj("a", "u-a"), obj("c", "u-c")]);
        let mut got = actions(&classify(&store, &ar, &relist));
        got.sort_by(|x, y| x.1.cmp(&y.1));
        assert_eq!(
            got,
            vec![(Action::Update, "u-a".into()), (Action::Delete, "u-b".into()), (Action::Create, "u-c".into())]
        );
    }
}
