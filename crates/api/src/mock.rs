use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use tally_core::{Action, OwnerTag};

use crate::{HashItem, HashList, InventoryApi, ResourceUpdate};

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub action: Action,
    pub uid: String,
    pub hash: String,
}

/// In-memory inventory for tests. Records every call; failures are scripted
/// per identifier (status code) or globally (transport down).
#[derive(Default)]
pub struct MockInventory {
    hashes: Mutex<HashList>,
    calls: Mutex<Vec<MockCall>>,
    failing: Mutex<HashMap<String, u16>>,
    offline: AtomicBool,
}

impl MockInventory {
    pub fn new() -> Self { Self::default() }

    pub fn with_hashes(items: Vec<(&str, &str)>) -> Self {
        let me = Self::default();
        *me.hashes.lock().unwrap_or_else(PoisonError::into_inner) = HashList {
            items: items.into_iter().map(|(uid, hash)| HashItem { uid: uid.to_string(), hash: hash.to_string() }).collect(),
        };
        me
    }

    /// Answer mutations for `uid` with `status` until [`MockInventory::heal`].
    pub fn fail_with_status(&self, uid: &str, status: u16) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(uid.to_string(), status);
    }

    pub fn heal(&self, uid: &str) { self.failing.lock().unwrap_or_else(PoisonError::into_inner).remove(uid); }

    /// Fail every call at the transport level.
    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    pub fn calls(&self) -> Vec<MockCall> { self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn calls_for(&self, uid: &str) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.uid == uid).collect()
    }

    fn record(&self, action: Action, update: &ResourceUpdate) -> anyhow::Result<u16> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(MockCall {
            action,
            uid: update.uid.clone(),
            hash: update.hash.clone(),
        });
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(failing.get(&update.uid).copied().unwrap_or(200))
    }
}

#[async_trait::async_trait]
impl InventoryApi for MockInventory {
    async fn create(&self, update: &ResourceUpdate) -> anyhow::Result<u16> { self.record(Action::Create, update) }

    async fn update(&self, update: &ResourceUpdate) -> anyhow::Result<u16> { self.record(Action::Update, update) }

    async fn delete(&self, update: &ResourceUpdate) -> anyhow::Result<u16> { self.record(Action::Delete, update) }

    async fn hash_list(&self, _owner: &OwnerTag) -> anyhow::Result<HashList> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.hashes.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}
