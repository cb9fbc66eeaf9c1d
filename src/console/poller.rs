//! Poll-driven snapshot providers.
//!
//! One spawned task per data source. Each tick fetches, then either
//! replaces the whole snapshot (success) or keeps it and records the
//! error (failure). The next fetch is only dispatched once the previous
//! result has been applied, so a late response can never overwrite a
//! newer one. Snapshots are published through a `watch` channel: readers
//! always see a complete value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// A data source the console polls.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Short name used in logs (e.g. `"decisions"`).
    fn name(&self) -> &'static str;

    /// Fetches and validates the full current collection.
    async fn fetch(&self) -> Result<Vec<Self::Item>, FetchError>;
}

/// Result of the most recent successful fetch, plus fetch bookkeeping.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub items: Arc<Vec<T>>,
    /// False until the first fetch has succeeded.
    pub loaded: bool,
    /// Bumped on every successful fetch.
    pub generation: u64,
    /// Bumped when a fetch starts.
    pub dispatched: u64,
    /// Bumped on every completed fetch, successful or not.
    pub attempts: u64,
    /// Set by a failed fetch, cleared by the next successful one.
    pub last_error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            loaded: false,
            generation: 0,
            dispatched: 0,
            attempts: 0,
            last_error: None,
            fetched_at: None,
        }
    }
}

impl<T> Snapshot<T> {
    /// Applies one fetch result. Failure keeps the previous items.
    fn apply(&mut self, result: Result<Vec<T>, FetchError>) {
        self.attempts += 1;
        match result {
            Ok(items) => {
                self.items = Arc::new(items);
                self.loaded = true;
                self.generation += 1;
                self.last_error = None;
                self.fetched_at = Some(Utc::now());
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
            }
        }
    }
}

/// Called from the poller task with the fresh items after each
/// successful fetch, before readers are notified.
pub type Hook<T> = Box<dyn Fn(&[T]) + Send + Sync>;

/// Owner side of a running poller. Dropping it aborts the task.
pub struct PollerHandle<T> {
    name: &'static str,
    snapshot: watch::Receiver<Snapshot<T>>,
    refresh: Arc<Notify>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Starts polling `source` every `period`. The first fetch happens
/// immediately.
pub fn spawn<S: Source>(source: Arc<S>, period: Duration, hook: Option<Hook<S::Item>>) -> PollerHandle<S::Item> {
    let (tx, rx) = watch::channel(Snapshot::default());
    let refresh = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let name = source.name();

    let task = tokio::spawn(run(source, period, tx, refresh.clone(), shutdown_rx, hook));
    info!("Poller {name} started (every {}ms)", period.as_millis());

    PollerHandle {
        name,
        snapshot: rx,
        refresh,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn run<S: Source>(
    source: Arc<S>,
    period: Duration,
    tx: watch::Sender<Snapshot<S::Item>>,
    refresh: Arc<Notify>,
    mut shutdown: oneshot::Receiver<()>,
    hook: Option<Hook<S::Item>>,
) {
    let name = source.name();
    let mut tick = time::interval(period);
    // A slow fetch pushes the schedule back instead of bursting
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = refresh.notified() => {
                debug!("Poller {name}: refresh requested");
                tick.reset();
            }
            _ = &mut shutdown => break,
        }

        tx.send_modify(|snapshot| snapshot.dispatched += 1);
        let result = tokio::select! {
            result = source.fetch() => result,
            _ = &mut shutdown => break,
        };

        match &result {
            Ok(items) => {
                debug!("Poller {name}: {} item(s)", items.len());
                if let Some(hook) = &hook {
                    hook(items);
                }
            }
            Err(e) => warn!("Poller {name}: fetch failed, keeping previous snapshot: {e}"),
        }
        tx.send_modify(|snapshot| snapshot.apply(result));
    }

    debug!("Poller {name} stopped");
}

impl<T: Clone> PollerHandle<T> {
    /// Current snapshot (cheap: items are shared).
    pub fn snapshot(&self) -> Snapshot<T> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.snapshot.clone()
    }

    /// Asks for a fetch now. Runs after any fetch already in flight.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Requests a fetch and waits until a fetch dispatched after this call
    /// has completed. A fetch already in flight does not count: it may have
    /// read the backend before the caller's last action.
    pub async fn refresh_and_wait(&self) {
        let mut rx = self.snapshot.clone();
        // Fetches run one at a time, so the n-th dispatched fetch is done
        // once `attempts >= n`
        let target = rx.borrow_and_update().dispatched + 1;
        self.refresh();
        // Sender gone means the poller stopped; nothing left to wait for
        let _ = rx.wait_for(|s| s.attempts >= target).await;
    }

    /// Stops the poller and waits for its task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Poller {} stopped", self.name);
    }
}

impl<T> Drop for PollerHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
