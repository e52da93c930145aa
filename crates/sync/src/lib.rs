//! Tally sync: the forwarding pipeline behind every watcher and the periodic
//! jobs that repair what it could not deliver.

#![forbid(unsafe_code)]

mod forward;
mod gate;
mod jobs;
mod scheduler;

pub use forward::{FlushReport, Forwarded, Forwarder};
pub use jobs::{CacheStatsJob, CleanupJob, RetryFlushJob, SweepReport};
pub use scheduler::{Job, PeriodicScheduler, Schedule};
