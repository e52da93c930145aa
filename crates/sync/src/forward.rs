use std::sync::Arc;

use tally_api::SyncClient;
use tally_core::{Action, NormalizedResource, Normalizer, OwnerTag, PayloadMode, RawResource, ResourceHandler};
use tally_store::{ChangeCache, RetryQueue};
use tracing::{debug, warn};

use crate::gate::SendGate;

/// What happened to one watcher event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Sent,
    /// Content hash matches what the remote side already has.
    Unchanged,
    /// Send failed; the record waits in the retry queue.
    Queued,
    /// Malformed object; logged and dropped.
    Dropped,
}

/// Result of one retry flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// A send failed and the flush stopped there.
    pub halted: bool,
    pub remaining: usize,
}

/// The pipeline every watcher feeds: normalize, consult the cache, send,
/// and queue failures for the retry flush.
///
/// Live sends and re-sends of the same identifier never overlap; each one
/// settles the cache and the queue before the next starts.
pub struct Forwarder {
    normalizer: Normalizer,
    cache: Arc<ChangeCache>,
    retry: Arc<RetryQueue>,
    client: Arc<SyncClient>,
    gate: SendGate,
}

impl Forwarder {
    pub fn new(owner: OwnerTag, cache: Arc<ChangeCache>, retry: Arc<RetryQueue>, client: Arc<SyncClient>) -> Self {
        // kinds outside the catalog are still forwarded as generic payloads
        Self { normalizer: Normalizer::new(owner, PayloadMode::Passthrough), cache, retry, client, gate: SendGate::default() }
    }

    pub fn owner(&self) -> &OwnerTag { self.normalizer.owner() }

    pub async fn forward(&self, action: Action, raw: RawResource) -> Forwarded {
        let res = match self.normalizer.normalize(raw) {
            Ok(res) => res,
            Err(e) => {
                metrics::counter!("normalize_failures_total", 1u64);
                warn!(action = %action, error = %e, "dropping malformed resource");
                return Forwarded::Dropped;
            }
        };
        let _gate = self.gate.enter(&res.identifier).await;
        let id = res.identifier.as_str();

        if action != Action::Delete {
            self.cache.mark_active(id);
            if !self.cache.check_update_needed(id, &res.content_hash) {
                // a queued retry would now reintroduce an outdated state
                if self.retry.remove(id).is_some() {
                    debug!(uid = %id, "dropped stale retry item");
                }
                return Forwarded::Unchanged;
            }
        }

        match self.client.send(action, &res).await {
            Ok(()) => {
                self.settle(action, &res);
                self.retry.remove(id);
                Forwarded::Sent
            }
            Err(_) => {
                self.retry.add(res, action);
                Forwarded::Queued
            }
        }
    }

    /// Re-send queued failures oldest first. Stops at the first failure so an
    /// outage costs one request per cycle.
    pub async fn flush_retries(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for item in self.retry.consume_all() {
            let _gate = self.gate.enter(item.identifier()).await;
            // a live event settled this identifier while we waited
            if !self.retry.holds(item.identifier(), item.seq()) {
                continue;
            }
            match self.client.send(item.action, &item.resource).await {
                Ok(()) => {
                    report.sent += 1;
                    if self.retry.complete(item.identifier(), item.seq()) {
                        self.settle(item.action, &item.resource);
                    }
                }
                Err(e) => {
                    self.retry.record_failure(item.identifier(), item.seq());
                    debug!(uid = %item.identifier(), retry_count = item.retry_count + 1, error = %e, "retry failed; flush halted");
                    report.halted = true;
                    break;
                }
            }
        }
        report.remaining = self.retry.item_count();
        report
    }

    pub fn retry_queue(&self) -> &RetryQueue { &self.retry }

    /// Record a confirmed send in the cache.
    fn settle(&self, action: Action, res: &NormalizedResource) {
        if action == Action::Delete {
            self.cache.forget(&res.identifier);
        } else {
            self.cache.update_hash(&res.identifier, &res.content_hash);
        }
    }
}

#[async_trait::async_trait]
impl ResourceHandler for Forwarder {
    async fn handle(&self, action: Action, raw: RawResource) {
        self.forward(action, raw).await;
    }
}
