use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tally_core::HashListEntry;
use tracing::{debug, info};

use crate::lock;

#[derive(Debug, Clone)]
struct Entry {
    hash: String,
    active: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: FxHashMap<String, Entry>,
    cleanup_running: bool,
}

/// Identifier -> last forwarded content hash, plus the liveness flag used by
/// the mark-and-sweep cleanup.
///
/// An identifier missing from the map is unknown and always forwarded. The
/// stored hash only moves forward through [`ChangeCache::update_hash`], i.e.
/// after the remote side confirmed the send.
#[derive(Debug, Default)]
pub struct ChangeCache {
    inner: Mutex<Inner>,
}

impl ChangeCache {
    pub fn new() -> Self { Self::default() }

    /// Bootstrap from the remote hash list. Replaces whatever was there; all
    /// entries start inactive.
    pub fn init<I>(&self, remote: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut g = lock(&self.inner);
        g.entries = remote.into_iter().map(|(id, hash)| (id, Entry { hash, active: false })).collect();
        metrics::gauge!("cache_entries", g.entries.len() as f64);
        info!(entries = g.entries.len(), "change cache initialized");
    }

    /// True when `id` is unknown or its stored hash differs. Never mutates.
    pub fn check_update_needed(&self, id: &str, hash: &str) -> bool {
        let g = lock(&self.inner);
        g.entries.get(id).map_or(true, |e| e.hash != hash)
    }

    /// Record that `id` was observed during the open cleanup window.
    pub fn mark_active(&self, id: &str) {
        let mut g = lock(&self.inner);
        if !g.cleanup_running {
            return;
        }
        if let Some(e) = g.entries.get_mut(id) {
            e.active = true;
        }
    }

    /// Upsert after a confirmed send. `active` follows the window state, so an
    /// object first seen mid-window is not swept at its deadline.
    pub fn update_hash(&self, id: &str, hash: &str) {
        let mut g = lock(&self.inner);
        let active = g.cleanup_running;
        match g.entries.get_mut(id) {
            Some(e) => {
                e.hash.clear();
                e.hash.push_str(hash);
                e.active = active;
            }
            None => {
                g.entries.insert(id.to_string(), Entry { hash: hash.to_string(), active });
                metrics::gauge!("cache_entries", g.entries.len() as f64);
            }
        }
    }

    /// Drop `id` after the remote side confirmed its deletion.
    pub fn forget(&self, id: &str) -> bool {
        let mut g = lock(&self.inner);
        let removed = g.entries.remove(id).is_some();
        if removed {
            metrics::gauge!("cache_entries", g.entries.len() as f64);
        }
        removed
    }

    /// Identifiers not observed in the current window, sorted.
    pub fn inactive_identifiers(&self) -> Vec<String> {
        let g = lock(&self.inner);
        let mut out: Vec<String> = g.entries.iter().filter(|(_, e)| !e.active).map(|(id, _)| id.clone()).collect();
        out.sort_unstable();
        out
    }

    pub fn start_cleanup_window(&self) {
        let mut g = lock(&self.inner);
        g.cleanup_running = true;
        debug!(entries = g.entries.len(), "cleanup window opened");
    }

    /// Close the window and clear every active flag in one step. Returns how
    /// many entries had been marked.
    pub fn end_cleanup_window(&self) -> usize {
        let mut g = lock(&self.inner);
        g.cleanup_running = false;
        let mut marked = 0usize;
        for e in g.entries.values_mut() {
            if e.active {
                marked += 1;
                e.active = false;
            }
        }
        debug!(marked, "cleanup window closed");
        marked
    }

    pub fn cleanup_running(&self) -> bool { lock(&self.inner).cleanup_running }

    pub fn len(&self) -> usize { lock(&self.inner).entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn active_count(&self) -> usize { lock(&self.inner).entries.values().filter(|e| e.active).count() }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<HashListEntry> {
        let g = lock(&self.inner);
        g.entries
            .iter()
            .map(|(id, e)| HashListEntry { identifier: id.clone(), hash: e.hash.clone(), active: e.active })
            .collect()
    }

    /// Rough heap footprint: entry structs plus identifier/hash bytes.
    pub fn approx_bytes(&self) -> usize {
        let g = lock(&self.inner);
        let fixed = g.entries.capacity() * (std::mem::size_of::<String>() + std::mem::size_of::<Entry>());
        g.entries.iter().fold(fixed, |acc, (id, e)| acc + id.len() + e.hash.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn seeded(ids: &[&str]) -> ChangeCache {
        let c = ChangeCache::new();
        c.init(ids.iter().map(|id| (id.to_string(), format!("h-{id}"))));
        c
    }

    #[test]
    fn unknown_or_changed_needs_update() {
        let c = seeded(&["a"]);
        assert!(!c.check_update_needed("a", "h-a"));
        assert!(c.check_update_needed("a", "other"));
        assert!(c.check_update_needed("zzz", "h-a"));
    }

    #[test]
    fn check_does_not_store_the_hash() {
        let c = ChangeCache::new();
        assert!(c.check_update_needed("x", "1"));
        assert!(c.check_update_needed("x", "1"), "failed send must stay retryable");
        c.update_hash("x", "1");
        assert!(!c.check_update_needed("x", "1"));
    }

    #[test]
    fn mark_active_is_noop_without_window() {
        let c = seeded(&["a"]);
        c.mark_active("a");
        assert_eq!(c.active_count(), 0);
        c.start_cleanup_window();
        c.mark_active("a");
        c.mark_active("unknown");
        assert_eq!(c.active_count(), 1);
        assert_eq!(c.len(), 1, "marking must not create entries");
    }

    #[test]
    fn update_hash_follows_window_state() {
        let c = ChangeCache::new();
        c.update_hash("outside", "1");
        c.start_cleanup_window();
        c.update_hash("inside", "1");
        assert_eq!(c.inactive_identifiers(), vec!["outside".to_string()]);
    }

    #[test]
    fn mark_and_sweep_finds_unobserved() {
        let c = seeded(&["A", "B", "C"]);
        c.start_cleanup_window();
        c.mark_active("A");
        c.mark_active("B");
        assert_eq!(c.inactive_identifiers(), vec!["C".to_string()]);
        assert_eq!(c.end_cleanup_window(), 2);
        assert!(!c.cleanup_running());
        assert_eq!(c.active_count(), 0);
    }

    #[test]
    fn forget_removes_entry() {
        let c = seeded(&["a", "b"]);
        assert!(c.forget("a"));
        assert!(!c.forget("a"));
        assert!(c.check_update_needed("a", "h-a"));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn init_replaces_previous_contents() {
        let c = seeded(&["a"]);
        c.init(vec![("b".to_string(), "h".to_string())]);
        let snap = c.snapshot();
        assert_eq!(snap, vec![HashListEntry { identifier: "b".into(), hash: "h".into(), active: false }]);
    }

    #[test]
    fn concurrent_writers_keep_every_entry() {
        let c = Arc::new(ChangeCache::new());
        c.start_cleanup_window();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = format!("{t}-{i}");
                        if c.check_update_needed(&id, "h") {
                            c.update_hash(&id, "h");
                        }
                        c.mark_active(&id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.len(), 8 * 500);
        assert_eq!(c.active_count(), 8 * 500);
        assert!(c.approx_bytes() > 0);
    }
}
