//! Tally store: the change cache and retry queue shared by all watchers.
//!
//! Both structures are internally locked; callers hold them behind an `Arc`
//! and never see a half-applied entry.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

mod cache;
mod retry;

pub use cache::ChangeCache;
pub use retry::{RetryItem, RetryQueue};

/// Lock that survives a panicking holder. Every mutation in this crate leaves
/// the guarded state consistent before anything that could panic.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
