//! Bounded-memory list+watch loop.
//!
//! Objects are handed to the handler and dropped right away; nothing is kept
//! between events except the resourceVersion cursor.
//!
//! ```text
//! Init -> Listing -> Watching -> Listing -> ...
//!            |          |
//!            v          v (watch could not be opened)
//!         Backoff    Backoff
//! ```
//! Any state moves to `Stopped` when the cancel token fires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tally_core::{Action, RawResource, ResourceHandler, ResourceSchema, SyncConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::source::{ListWatchSource, ResourceEvent};
use crate::ResourceWatcher;

/// Doubling delay with an upper bound; `reset` after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self { Self { initial, max, current: initial.min(max) } }

    /// Delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        d
    }

    pub fn reset(&mut self) { self.current = self.initial.min(self.max); }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Listing,
    Watching,
    /// Sleeping before the next attempt. Resumes `Listing` when the cursor is
    /// empty, `Watching` otherwise.
    Backoff(Duration),
    Stopped,
}

enum ListOutcome {
    Done { resource_version: String, objects: usize },
    Failed,
    Cancelled,
}

enum WatchOutcome {
    /// Stream closed or the server invalidated the cursor.
    Relist,
    OpenFailed,
    Resync,
    Cancelled,
}

pub struct PagedWatcher<S> {
    schema: ResourceSchema,
    source: S,
    handler: Arc<dyn ResourceHandler>,
    page_size: u32,
    backoff: Backoff,
    phase: Phase,
    cursor: String,
    resync: Option<watch::Receiver<u64>>,
    lists_completed: u64,
}

impl<S: ListWatchSource> PagedWatcher<S> {
    pub fn new(schema: ResourceSchema, source: S, handler: Arc<dyn ResourceHandler>, cfg: &SyncConfig) -> Self {
        Self {
            schema,
            source,
            handler,
            page_size: cfg.page_size.max(1),
            backoff: Backoff::new(cfg.backoff_initial, cfg.backoff_max),
            phase: Phase::Init,
            cursor: String::new(),
            resync: None,
            lists_completed: 0,
        }
    }

    /// Restart from a full list whenever the epoch behind `rx` changes.
    pub fn with_resync(mut self, rx: watch::Receiver<u64>) -> Self {
        self.resync = Some(rx);
        self
    }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn cursor(&self) -> &str { &self.cursor }

    /// Full lists completed so far.
    pub fn lists_completed(&self) -> u64 { self.lists_completed }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Phase {
        if cancel.is_cancelled() {
            self.phase = Phase::Stopped;
            return self.phase;
        }
        self.phase = match self.phase {
            Phase::Init => {
                self.cursor.clear();
                Phase::Listing
            }
            Phase::Listing => match self.list_all(cancel).await {
                ListOutcome::Done { resource_version, objects } => {
                    self.cursor = resource_version;
                    self.lists_completed += 1;
                    if self.lists_completed == 1 {
                        info!(gvr = %self.schema, objects, "initial list complete");
                    } else {
                        debug!(gvr = %self.schema, objects, "relist complete");
                    }
                    Phase::Watching
                }
                ListOutcome::Failed => {
                    self.cursor.clear();
                    Phase::Backoff(self.backoff.next_delay())
                }
                ListOutcome::Cancelled => Phase::Stopped,
            },
            Phase::Watching => match self.watch_once(cancel).await {
                WatchOutcome::Relist | WatchOutcome::Resync => {
                    metrics::counter!("watch_relists_total", 1u64, "gvr" => self.schema.to_string());
                    self.cursor.clear();
                    Phase::Listing
                }
                WatchOutcome::OpenFailed => Phase::Backoff(self.backoff.next_delay()),
                WatchOutcome::Cancelled => Phase::Stopped,
            },
            Phase::Backoff(wait) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Phase::Stopped,
                    _ = tokio::time::sleep(wait) => {
                        if self.cursor.is_empty() { Phase::Listing } else { Phase::Watching }
                    }
                }
            }
            Phase::Stopped => Phase::Stopped,
        };
        self.phase
    }

    async fn list_all(&mut self, cancel: &CancellationToken) -> ListOutcome {
        // this list covers every resync requested so far
        if let Some(rx) = self.resync.as_mut() {
            rx.borrow_and_update();
        }
        let started = Instant::now();
        let mut token: Option<String> = None;
        let mut objects = 0usize;
        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ListOutcome::Cancelled,
                page = self.source.list_page(self.page_size, token.as_deref()) => page,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    error!(gvr = %self.schema, error = %format!("{e:#}"), "no-cache list failed");
                    return ListOutcome::Failed;
                }
            };
            self.backoff.reset();
            objects += page.items.len();
            for item in page.items {
                self.handler.handle(Action::Create, item).await;
            }
            match page.continue_token {
                Some(next) => token = Some(next),
                None => {
                    metrics::histogram!("watch_list_ms", started.elapsed().as_secs_f64() * 1000.0, "gvr" => self.schema.to_string());
                    return ListOutcome::Done { resource_version: page.resource_version, objects };
                }
            }
        }
    }

    async fn watch_once(&mut self, cancel: &CancellationToken) -> WatchOutcome {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            s = self.source.watch(&self.cursor) => s,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                error!(gvr = %self.schema, error = %format!("{e:#}"), "no-cache watch failed");
                return WatchOutcome::OpenFailed;
            }
        };
        self.backoff.reset();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = resync_requested(&mut self.resync) => {
                    debug!(gvr = %self.schema, "resync requested");
                    return WatchOutcome::Resync;
                }
                ev = stream.next() => ev,
            };
            let event = match next {
                None => {
                    debug!(gvr = %self.schema, "watch stream closed");
                    return WatchOutcome::Relist;
                }
                Some(Err(e)) => {
                    warn!(gvr = %self.schema, error = %format!("{e:#}"), "watch stream failed");
                    return WatchOutcome::Relist;
                }
                Some(Ok(ev)) => ev,
            };
            match event {
                ResourceEvent::Bookmark { resource_version } => {
                    if !resource_version.is_empty() {
                        self.cursor = resource_version;
                    }
                }
                ResourceEvent::Added(obj) => self.forward(Action::Create, obj).await,
                ResourceEvent::Modified(obj) => self.forward(Action::Update, obj).await,
                ResourceEvent::Deleted(obj) => self.forward(Action::Delete, obj).await,
                ResourceEvent::Error { code, message } => {
                    warn!(gvr = %self.schema, code, message = %message, "watch error event; relisting");
                    return WatchOutcome::Relist;
                }
            }
        }
    }

    async fn forward(&mut self, action: Action, obj: RawResource) {
        if let Some(rv) = obj.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if !rv.is_empty() {
                self.cursor = rv.to_string();
            }
        }
        self.handler.handle(action, obj).await;
    }
}

/// Resolves when a resync was requested; never resolves without a channel or
/// once the sender is gone.
pub(crate) async fn resync_requested(rx: &mut Option<watch::Receiver<u64>>) {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[async_trait::async_trait]
impl<S: ListWatchSource + 'static> ResourceWatcher for PagedWatcher<S> {
    fn schema(&self) -> &ResourceSchema { &self.schema }

    async fn run(mut self: Box<Self>, cancel: CancellationToken) {
        info!(gvr = %self.schema, "no-cache watcher started");
        while self.step(&cancel).await != Phase::Stopped {}
        info!(gvr = %self.schema, "no-cache watcher stopped");
    }
}
