use std::collections::VecDeque;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tally_core::{Action, NormalizedResource};
use tracing::debug;

use crate::lock;

/// A send that failed and waits for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryItem {
    pub resource: NormalizedResource,
    pub action: Action,
    pub retry_count: u32,
    seq: u64,
}

impl RetryItem {
    /// Queue generation; changes whenever a newer event replaces this item.
    pub fn seq(&self) -> u64 { self.seq }

    pub fn identifier(&self) -> &str { &self.resource.identifier }
}

#[derive(Debug)]
struct Slot {
    item: RetryItem,
    /// Position ticket in `order`; kept when a newer item replaces this one.
    ticket: u64,
}

#[derive(Debug, Default)]
struct Inner {
    map: FxHashMap<String, Slot>,
    /// `(ticket, id)` in arrival order. Entries whose ticket no longer matches
    /// the map are dead and skipped; they are pruned lazily.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    superseded: u64,
}

impl Inner {
    fn is_live(&self, ticket: u64, id: &str) -> bool { self.map.get(id).map_or(false, |s| s.ticket == ticket) }

    fn take(&mut self, id: &str) -> Option<RetryItem> {
        let slot = self.map.remove(id)?;
        if self.map.is_empty() {
            self.order.clear();
        } else if self.order.len() > 2 * self.map.len() + 64 {
            self.prune();
        }
        metrics::gauge!("retry_queue_items", self.map.len() as f64);
        Some(slot.item)
    }

    fn prune(&mut self) {
        let order = std::mem::take(&mut self.order);
        self.order = order.into_iter().filter(|(ticket, id)| self.is_live(*ticket, id)).collect();
    }
}

/// Failed sends keyed by identifier with FIFO order. A newer item for the same
/// identifier replaces the queued one in place.
#[derive(Debug, Default)]
pub struct RetryQueue {
    inner: Mutex<Inner>,
}

impl RetryQueue {
    pub fn new() -> Self { Self::default() }

    /// Queue `resource`; returns true if it replaced an older item.
    pub fn add(&self, resource: NormalizedResource, action: Action) -> bool {
        let mut g = lock(&self.inner);
        g.next_seq += 1;
        let seq = g.next_seq;
        let id = resource.identifier.clone();
        let item = RetryItem { resource, action, retry_count: 0, seq };
        let replaced = match g.map.get_mut(&id) {
            Some(slot) => {
                slot.item = item;
                g.superseded += 1;
                true
            }
            None => {
                g.order.push_back((seq, id.clone()));
                g.map.insert(id, Slot { item, ticket: seq });
                false
            }
        };
        metrics::gauge!("retry_queue_items", g.map.len() as f64);
        replaced
    }

    /// Everything queued, oldest first. Items stay queued until
    /// [`RetryQueue::complete`] confirms them.
    pub fn consume_all(&self) -> Vec<RetryItem> {
        let mut g = lock(&self.inner);
        g.prune();
        g.order.iter().filter_map(|(_, id)| g.map.get(id).map(|s| s.item.clone())).collect()
    }

    /// Remove `id` if it is still the generation that was sent.
    pub fn complete(&self, id: &str, seq: u64) -> bool {
        let mut g = lock(&self.inner);
        if g.map.get(id).map(|s| s.item.seq) != Some(seq) {
            debug!(uid = %id, "retry item superseded while in flight");
            return false;
        }
        g.take(id).is_some()
    }

    /// Count another failed attempt for the item generation that was sent.
    pub fn record_failure(&self, id: &str, seq: u64) {
        let mut g = lock(&self.inner);
        if let Some(slot) = g.map.get_mut(id).filter(|s| s.item.seq == seq) {
            slot.item.retry_count = slot.item.retry_count.saturating_add(1);
        }
    }

    /// Drop whatever is queued for `id`, e.g. after a newer live send succeeded.
    pub fn remove(&self, id: &str) -> Option<RetryItem> { lock(&self.inner).take(id) }

    /// True if generation `seq` is still the one queued for `id`.
    pub fn holds(&self, id: &str, seq: u64) -> bool { lock(&self.inner).map.get(id).map_or(false, |s| s.item.seq == seq) }

    pub fn item_count(&self) -> usize { lock(&self.inner).map.len() }

    pub fn need_to_run(&self) -> bool { self.item_count() > 0 }

    /// How many queued items were replaced by newer ones.
    pub fn superseded(&self) -> u64 { lock(&self.inner).superseded }

    /// Length of the internal order list, dead entries included.
    #[cfg(test)]
    fn order_len(&self) -> usize { lock(&self.inner).order.len() }
}
