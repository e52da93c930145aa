#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_api::{MockInventory, SyncClient};
use tally_core::{Action, OwnerTag, RawResource, ResourceHandler};
use tally_store::{ChangeCache, RetryQueue};
use tally_sync::{CleanupJob, Forwarder, PeriodicScheduler, RetryFlushJob, Schedule};
use tokio_util::sync::CancellationToken;

fn deploy(uid: &str, replicas: u32) -> RawResource {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": uid, "namespace": "prod", "uid": uid, "resourceVersion": "1" },
        "spec": { "replicas": replicas }
    })
}

struct Agent {
    mock: Arc<MockInventory>,
    cache: Arc<ChangeCache>,
    retry: Arc<RetryQueue>,
    client: Arc<SyncClient>,
    forwarder: Arc<Forwarder>,
}

fn agent(remote: Vec<(&str, &str)>) -> Agent {
    let mock = Arc::new(MockInventory::with_hashes(remote));
    let client = Arc::new(SyncClient::new(mock.clone()));
    let cache = Arc::new(ChangeCache::new());
    let retry = Arc::new(RetryQueue::new());
    let forwarder = Arc::new(Forwarder::new(OwnerTag::cluster("c-1"), cache.clone(), retry.clone(), client.clone()));
    Agent { mock, cache, retry, client, forwarder }
}

#[tokio::test(start_paused = true)]
async fn outage_is_repaired_by_the_retry_flush() {
    let a = agent(vec![]);
    let cancel = CancellationToken::new();
    let mut sched = PeriodicScheduler::new(cancel.clone());
    sched.every(Duration::from_secs(10), Arc::new(RetryFlushJob::new(a.forwarder.clone())));
    let handle = sched.spawn();

    a.mock.set_offline(true);
    let handler: Arc<dyn ResourceHandler> = a.forwarder.clone();
    handler.handle(Action::Create, deploy("d-1", 1)).await;
    handler.handle(Action::Create, deploy("d-2", 1)).await;
    handler.handle(Action::Update, deploy("d-1", 3)).await;
    assert_eq!(a.retry.item_count(), 2);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(a.retry.item_count(), 2);

    a.mock.set_offline(false);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(a.retry.item_count(), 0);
    assert_eq!(a.cache.len(), 2);
    // latest payload for d-1 went out as an update
    let d1 = a.mock.calls_for("d-1");
    assert_eq!(d1.len(), 1);
    assert_eq!(d1[0].action, Action::Update);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn daily_cleanup_removes_objects_deleted_while_down() {
    let a = agent(vec![]);
    // state from a previous run: d-1 still exists, d-gone was deleted while the agent was down
    a.forwarder.forward(Action::Create, deploy("d-1", 1)).await;
    let previous = a.cache.snapshot();
    let remote: Vec<(String, String)> = previous
        .iter()
        .map(|e| (e.identifier.clone(), e.hash.clone()))
        .chain([("d-gone".to_string(), "stale".to_string())])
        .collect();

    let b = agent(vec![]);
    b.cache.init(remote);
    b.cache.start_cleanup_window();
    // startup list re-observes d-1 only
    b.forwarder.forward(Action::Create, deploy("d-1", 1)).await;
    assert!(b.mock.calls().is_empty());

    let cancel = CancellationToken::new();
    let mut sched = PeriodicScheduler::new(cancel.clone());
    sched.add(
        Schedule::After { first: Duration::from_secs(60), period: Duration::from_secs(24 * 3600) },
        Arc::new(CleanupJob::new(b.cache.clone(), b.client.clone(), OwnerTag::cluster("c-1"))),
    );
    let handle = sched.spawn();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let calls = b.mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].action, calls[0].uid.as_str()), (Action::Delete, "d-gone"));
    assert_eq!(b.cache.len(), 1);
    assert!(b.cache.cleanup_running());

    cancel.cancel();
    handle.await.unwrap();
}
