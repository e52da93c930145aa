use std::sync::Arc;

use tally_api::SyncClient;
use tally_core::{Action, NormalizedResource, OwnerTag};
use tally_store::{ChangeCache, RetryQueue};
use tracing::{info, warn};

use crate::scheduler::Job;
use crate::Forwarder;

pub struct RetryFlushJob {
    forwarder: Arc<Forwarder>,
}

impl RetryFlushJob {
    pub fn new(forwarder: Arc<Forwarder>) -> Self { Self { forwarder } }
}

#[async_trait::async_trait]
impl Job for RetryFlushJob {
    fn tag(&self) -> &str { "retry-flush" }

    async fn run(&self) {
        if !self.forwarder.retry_queue().need_to_run() {
            return;
        }
        let report = self.forwarder.flush_retries().await;
        metrics::counter!("retry_resent_total", report.sent as u64);
        if report.halted {
            warn!(sent = report.sent, remaining = report.remaining, "retry flush halted on failure");
        } else {
            info!(sent = report.sent, remaining = report.remaining, "retry queue flushed");
        }
    }
}

/// Result of one mark-and-sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inactive: usize,
    pub deleted: usize,
    pub failed: usize,
    pub marked: usize,
}

type WindowHook = Box<dyn Fn() + Send + Sync>;

/// Daily reconciliation: delete everything the window never saw, then open
/// the next window.
pub struct CleanupJob {
    cache: Arc<ChangeCache>,
    client: Arc<SyncClient>,
    owner: OwnerTag,
    on_window_open: Option<WindowHook>,
}

impl CleanupJob {
    pub fn new(cache: Arc<ChangeCache>, client: Arc<SyncClient>, owner: OwnerTag) -> Self {
        Self { cache, client, owner, on_window_open: None }
    }

    /// Called right after each new window opens, e.g. to make watchers relist.
    pub fn on_window_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_window_open = Some(Box::new(hook));
        self
    }

    pub async fn sweep(&self) -> SweepReport {
        let inactive = self.cache.inactive_identifiers();
        let mut report = SweepReport { inactive: inactive.len(), ..Default::default() };
        for id in &inactive {
            let tombstone = NormalizedResource::tombstone(id, self.owner.clone());
            match self.client.send(Action::Delete, &tombstone).await {
                Ok(()) => {
                    self.cache.forget(id);
                    report.deleted += 1;
                }
                // stays cached and inactive, so the next sweep tries again
                Err(_) => report.failed += 1,
            }
        }
        metrics::counter!("cleanup_deleted_total", report.deleted as u64);
        info!(
            inactive = report.inactive,
            deleted = report.deleted,
            failed = report.failed,
            remaining = self.cache.len(),
            "cleanup sweep finished"
        );

        report.marked = self.cache.end_cleanup_window();
        self.cache.start_cleanup_window();
        if let Some(hook) = &self.on_window_open {
            hook();
        }
        report
    }
}

#[async_trait::async_trait]
impl Job for CleanupJob {
    fn tag(&self) -> &str { "cache-cleanup" }

    async fn run(&self) {
        self.sweep().await;
    }
}

/// Publishes cache and queue sizes.
pub struct CacheStatsJob {
    cache: Arc<ChangeCache>,
    retry: Arc<RetryQueue>,
}

impl CacheStatsJob {
    pub fn new(cache: Arc<ChangeCache>, retry: Arc<RetryQueue>) -> Self { Self { cache, retry } }
}

#[async_trait::async_trait]
impl Job for CacheStatsJob {
    fn tag(&self) -> &str { "cache-stats" }

    async fn run(&self) {
        let entries = self.cache.len();
        let active = self.cache.active_count();
        let bytes = self.cache.approx_bytes();
        let queued = self.retry.item_count();
        metrics::gauge!("cache_active_entries", active as f64);
        metrics::gauge!("cache_approx_bytes", bytes as f64);
        info!(entries, active, approx_bytes = bytes, retry_items = queued, superseded = self.retry.superseded(), "cache stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_api::MockInventory;

    fn client(mock: &Arc<MockInventory>) -> Arc<SyncClient> { Arc::new(SyncClient::new(mock.clone())) }

    #[tokio::test]
    async fn sweep_deletes_only_unobserved_identifiers() {
        let mock = Arc::new(MockInventory::new());
        let cache = Arc::new(ChangeCache::new());
        cache.init(["A", "B", "C"].map(|id| (id.to_string(), format!("h-{id}"))));
        cache.start_cleanup_window();
        cache.mark_active("A");
        cache.mark_active("B");

        let opened = Arc::new(AtomicUsize::new(0));
        let hook_count = opened.clone();
        let job = CleanupJob::new(cache.clone(), client(&mock), OwnerTag::cluster("c-1"))
            .on_window_open(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            });
        let report = job.sweep().await;

        assert_eq!(report, SweepReport { inactive: 1, deleted: 1, failed: 0, marked: 2 });
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].action, calls[0].uid.as_str()), (Action::Delete, "C"));
        assert_eq!(cache.len(), 2);
        assert!(cache.cleanup_running());
        // new window: nothing observed yet
        assert_eq!(cache.inactive_identifiers(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_sweep_delete_is_retried_next_window() {
        let mock = Arc::new(MockInventory::new());
        let cache = Arc::new(ChangeCache::new());
        cache.init([("C".to_string(), "h".to_string())]);
        cache.start_cleanup_window();
        mock.set_offline(true);

        let job = CleanupJob::new(cache.clone(), client(&mock), OwnerTag::cluster("c-1"));
        assert_eq!(job.sweep().await.failed, 1);
        assert_eq!(cache.inactive_identifiers(), vec!["C".to_string()]);

        mock.set_offline(false);
        assert_eq!(job.sweep().await.deleted, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn flush_job_skips_empty_queue() {
        let mock = Arc::new(MockInventory::new());
        let fwd = Forwarder::new(OwnerTag::cluster("c-1"), Arc::new(ChangeCache::new()), Arc::new(RetryQueue::new()), client(&mock));
        let job = RetryFlushJob::new(Arc::new(fwd));
        job.run().await;
        assert!(mock.calls().is_empty());
        assert_eq!(job.tag(), "retry-flush");
    }
}
