//! Per-identifier exclusion between the live forwarding path and the retry
//! flush.
//!
//! A send and the cache/queue bookkeeping that follows it run as one unit per
//! identifier, so the remote side and the cache always agree on which state
//! landed last.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct SendGate {
    slots: Mutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a SendGate,
    id: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl SendGate {
    /// Wait until no other send for `id` is in flight.
    pub(crate) async fn enter(&self, id: &str) -> GateGuard<'_> {
        let slot = self.slots.lock().unwrap_or_else(PoisonError::into_inner).entry(id.to_string()).or_default().clone();
        let held = slot.lock_owned().await;
        GateGuard { gate: self, id: id.to_string(), held: Some(held) }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize { self.slots.lock().unwrap_or_else(PoisonError::into_inner).len() }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.gate.slots.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.held.take());
        // only the map's own handle left: nobody holds or waits for this id
        if slots.get(&self.id).map_or(false, |s| Arc::strong_count(s) == 1) {
            slots.remove(&self.id);
        }
    }
}
