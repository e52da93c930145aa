//! Single-task periodic runner.
//!
//! Jobs run one after another on the scheduler task, so a job never overlaps
//! itself or any other job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait::async_trait]
pub trait Job: Send + Sync {
    fn tag(&self) -> &str;

    async fn run(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// First run one period after start.
    Every(Duration),
    /// First run after `first`, then every `period`.
    After { first: Duration, period: Duration },
}

impl Schedule {
    fn first(&self) -> Duration {
        match *self {
            Schedule::Every(p) => p,
            Schedule::After { first, .. } => first,
        }
    }

    fn period(&self) -> Duration {
        match *self {
            Schedule::Every(p) | Schedule::After { period: p, .. } => p,
        }
    }
}

struct Entry {
    job: Arc<dyn Job>,
    schedule: Schedule,
    next: Instant,
}

pub struct PeriodicScheduler {
    entries: Vec<Entry>,
    cancel: CancellationToken,
}

impl PeriodicScheduler {
    pub fn new(cancel: CancellationToken) -> Self { Self { entries: Vec::new(), cancel } }

    pub fn add(&mut self, schedule: Schedule, job: Arc<dyn Job>) -> &mut Self {
        let period = schedule.period().max(Duration::from_millis(1));
        let schedule = match schedule {
            Schedule::Every(_) => Schedule::Every(period),
            Schedule::After { first, .. } => Schedule::After { first, period },
        };
        debug!(tag = job.tag(), ?schedule, "job scheduled");
        self.entries.push(Entry { job, next: Instant::now() + schedule.first(), schedule });
        self
    }

    pub fn every(&mut self, period: Duration, job: Arc<dyn Job>) -> &mut Self { self.add(Schedule::Every(period), job) }

    pub fn tags(&self) -> Vec<&str> { self.entries.iter().map(|e| e.job.tag()).collect() }

    pub fn spawn(self) -> JoinHandle<()> { tokio::spawn(self.run()) }

    /// Run jobs as they come due until cancelled. Runs that were missed while
    /// another job was busy collapse into one.
    pub async fn run(mut self) {
        info!(jobs = ?self.tags(), "scheduler started");
        loop {
            let Some(idx) = self.entries.iter().enumerate().min_by_key(|(_, e)| e.next).map(|(i, _)| i) else {
                self.cancel.cancelled().await;
                break;
            };
            let due = self.entries[idx].next;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }

            let entry = &mut self.entries[idx];
            debug!(tag = entry.job.tag(), "running job");
            entry.job.run().await;
            let period = entry.schedule.period();
            let now = Instant::now();
            entry.next += period;
            if entry.next <= now {
                entry.next = now + period;
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Log {
        tag: &'static str,
        runs: Arc<Mutex<Vec<(&'static str, Duration)>>>,
        start: Instant,
    }

    #[async_trait::async_trait]
    impl Job for Log {
        fn tag(&self) -> &str { self.tag }
        async fn run(&self) {
            self.runs.lock().unwrap().push((self.tag, self.start.elapsed()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_jobs_on_their_own_schedules() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let mut sched = PeriodicScheduler::new(cancel.clone());
        sched.every(Duration::from_secs(10), Arc::new(Log { tag: "flush", runs: runs.clone(), start }));
        sched.add(
            Schedule::After { first: Duration::from_secs(25), period: Duration::from_secs(100) },
            Arc::new(Log { tag: "cleanup", runs: runs.clone(), start }),
        );
        assert_eq!(sched.tags(), vec!["flush", "cleanup"]);
        let handle = sched.spawn();

        tokio::time::sleep(Duration::from_secs(131)).await;
        cancel.cancel();
        handle.await.unwrap();

        let runs = runs.lock().unwrap().clone();
        let cleanup: Vec<u64> = runs.iter().filter(|r| r.0 == "cleanup").map(|r| r.1.as_secs()).collect();
        let flush = runs.iter().filter(|r| r.0 == "flush").count();
        assert_eq!(cleanup, vec![25, 125]);
        assert_eq!(flush, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_an_idle_scheduler() {
        let cancel = CancellationToken::new();
        let handle = PeriodicScheduler::new(cancel.clone()).spawn();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
