//! Counter synchronizer.
//!
//! One mounted counter widget is one synchronizer task. It loads the shared
//! count, counts this session's view once the dwell completes, and keeps the
//! displayed value in step with every other client through the store's
//! change feed.
//!
//! Two state machines run side by side:
//!
//! - display: `Uninitialized -> Loading -> Ready(count)`
//! - session: `NotCounted -> DwellPending -> Counted`
//!
//! The task is driven through a [`SyncHandle`]. Unmounting (or dropping the
//! handle) cancels the dwell timer and the subscription on every path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::counter::CounterRecord;
use crate::display::{spawn_projector, CounterView, ProjectorOptions};
use crate::dwell::DwellTimer;
use crate::error::Result;
use crate::session::SessionGate;
use crate::store::{fetch_or_initialize, CounterStore, Subscription};

/// An in-flight read of the count.
type LoadFuture = Pin<Box<dyn Future<Output = Result<CounterRecord>> + Send>>;

/// Commands queued from the handle to the task.
const COMMAND_CAPACITY: usize = 16;

/// What the widget can currently show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "count", rename_all = "snake_case")]
pub enum DisplayState {
    /// Nothing requested yet.
    Uninitialized,
    /// Waiting for the first count.
    Loading,
    /// Showing an authoritative count.
    Ready(u64),
}

/// Progress of this session's single view increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No dwell has started.
    NotCounted,
    /// Waiting for the visitor to stay long enough.
    DwellPending,
    /// This session's view is in the store.
    Counted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCounted => write!(f, "not_counted"),
            Self::DwellPending => write!(f, "dwell_pending"),
            Self::Counted => write!(f, "counted"),
        }
    }
}

/// Point-in-time state of a mounted synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    /// Display state machine.
    pub display: DisplayState,
    /// Session-increment state machine.
    pub session: SessionState,
    /// Whether the page is visible.
    pub visible: bool,
    /// Whether a dwell countdown is running.
    pub dwell_active: bool,
}

/// Settings for one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Page to count.
    pub page_id: String,
    /// Visible time required before the view counts.
    pub minimum_dwell: Duration,
    /// Display animation timing.
    pub projector: ProjectorOptions,
    /// Whether the page is visible at mount.
    pub visible: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_id: "main".to_string(),
            minimum_dwell: Duration::from_millis(5_000),
            projector: ProjectorOptions::default(),
            visible: true,
        }
    }
}

impl SyncOptions {
    /// Build mount options from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_id: config.store.page_id.clone(),
            minimum_dwell: config.minimum_dwell(),
            projector: ProjectorOptions {
                duration: config.animation_duration(),
                frame_interval: config.frame_interval(),
            },
            visible: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    SetVisible(bool),
    Refresh,
    Unmount,
}

/// Handle to a mounted counter.
///
/// Dropping the handle unmounts the counter without waiting for cleanup;
/// [`SyncHandle::unmount`] waits for it.
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    counts: watch::Receiver<Option<u64>>,
    view: watch::Receiver<CounterView>,
    snapshot: watch::Receiver<SyncSnapshot>,
    task: Option<JoinHandle<()>>,
    projector: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// The rendered view, animated.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<CounterView> {
        self.view.clone()
    }

    /// The raw authoritative count, `None` while loading.
    #[must_use]
    pub fn counts(&self) -> watch::Receiver<Option<u64>> {
        self.counts.clone()
    }

    /// Current state of both state machines.
    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        *self.snapshot.borrow()
    }

    /// Report that the page became visible or hidden.
    pub async fn set_visible(&self, visible: bool) {
        self.send(Command::SetVisible(visible)).await;
    }

    /// Retry loading the count, e.g. after the store was unreachable.
    pub async fn refresh(&self) {
        self.send(Command::Refresh).await;
    }

    /// Unmount and wait until the timer and subscription are released.
    pub async fn unmount(mut self) {
        self.send(Command::Unmount).await;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Synchronizer task failed");
            }
        }
        if let Some(projector) = self.projector.take() {
            let _ = projector.await;
        }
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!("Synchronizer already stopped");
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(projector) = self.projector.take() {
            projector.abort();
        }
    }
}

/// Mount a counter for `options.page_id`.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn mount(store: Arc<dyn CounterStore>, gate: SessionGate, options: SyncOptions) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (elapsed_tx, elapsed_rx) = mpsc::channel(1);
    let (count_tx, count_rx) = watch::channel(None);
    let (view_tx, view_rx) = watch::channel(CounterView::loading());

    let initial = SyncSnapshot {
        display: DisplayState::Uninitialized,
        session: SessionState::NotCounted,
        visible: options.visible,
        dwell_active: false,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);

    let projector = spawn_projector(count_rx.clone(), view_tx, options.projector);

    let synchronizer = CounterSynchronizer {
        store,
        gate,
        page_id: options.page_id,
        minimum_dwell: options.minimum_dwell,
        visible: options.visible,
        display: DisplayState::Uninitialized,
        session: SessionState::NotCounted,
        timer: DwellTimer::new(),
        dwell_cycle: 0,
        elapsed_tx,
        counts: count_tx,
        snapshot: snapshot_tx,
    };
    let task = tokio::spawn(synchronizer.run(command_rx, elapsed_rx));

    SyncHandle {
        commands: command_tx,
        counts: count_rx,
        view: view_rx,
        snapshot: snapshot_rx,
        task: Some(task),
        projector: Some(projector),
    }
}

#[derive(Debug)]
struct CounterSynchronizer {
    store: Arc<dyn CounterStore>,
    gate: SessionGate,
    page_id: String,
    minimum_dwell: Duration,
    visible: bool,
    display: DisplayState,
    session: SessionState,
    timer: DwellTimer,
    /// Bumped on every start and cancel so a late elapse is recognised as stale.
    dwell_cycle: u64,
    elapsed_tx: mpsc::Sender<u64>,
    counts: watch::Sender<Option<u64>>,
    snapshot: watch::Sender<SyncSnapshot>,
}

impl CounterSynchronizer {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut elapsed: mpsc::Receiver<u64>) {
        info!(page_id = %self.page_id, store = self.store.name(), "Counter mounted");

        // Subscribe before loading so no change between the two is missed
        let mut subscription = match self.store.subscribe(&self.page_id).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(page_id = %self.page_id, error = %err, "Live updates unavailable");
                None
            }
        };

        if self.gate.has_counted() {
            self.session = SessionState::Counted;
        } else {
            self.session = SessionState::DwellPending;
            self.start_dwell();
        }
        self.publish_snapshot();

        let mut loading = Some(self.start_load());

        loop {
            // Commands win ties so a hide or unmount queued behind a slow
            // store is applied before a dwell that elapsed meanwhile
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::SetVisible(visible)) => self.set_visible(visible),
                    Some(Command::Refresh) => loading = Some(self.start_load()),
                    Some(Command::Unmount) | None => break,
                },
                result = next_load(&mut loading) => {
                    loading = None;
                    self.on_loaded(result);
                }
                Some(cycle) = elapsed.recv() => self.on_dwell_elapsed(cycle).await,
                change = next_change(&mut subscription) => match change {
                    Some(record) => self.on_change(&record),
                    None => {
                        warn!(page_id = %self.page_id, "Change feed closed, live updates stopped");
                        subscription = None;
                    }
                },
            }
        }

        self.cancel_dwell();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        info!(page_id = %self.page_id, session = %self.session, "Counter unmounted");
    }

    /// Begin reading the count. The read runs inside the select loop so
    /// commands keep being served while the store is slow.
    fn start_load(&mut self) -> LoadFuture {
        if self.display == DisplayState::Uninitialized {
            self.display = DisplayState::Loading;
            self.publish_snapshot();
        }

        let store = Arc::clone(&self.store);
        let page_id = self.page_id.clone();
        Box::pin(async move { fetch_or_initialize(store.as_ref(), &page_id).await })
    }

    fn on_loaded(&mut self, result: Result<CounterRecord>) {
        match result {
            Ok(record) => self.apply_count(record.count, "fetch"),
            Err(err) => {
                warn!(
                    page_id = %self.page_id,
                    error = %err,
                    unreachable = err.is_store_unreachable(),
                    "Could not load view count"
                );
            }
        }
    }

    fn set_visible(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;

        if self.session == SessionState::DwellPending {
            if visible {
                debug!(page_id = %self.page_id, "Page visible, restarting dwell");
                self.start_dwell();
            } else {
                debug!(page_id = %self.page_id, "Page hidden, dwell cancelled");
                self.cancel_dwell();
            }
        }
        self.publish_snapshot();
    }

    fn start_dwell(&mut self) {
        if !self.visible {
            return;
        }
        self.dwell_cycle += 1;
        let cycle = self.dwell_cycle;
        let elapsed = self.elapsed_tx.clone();
        self.timer.start(self.minimum_dwell, move || {
            let _ = elapsed.try_send(cycle);
        });
    }

    fn cancel_dwell(&mut self) {
        self.dwell_cycle += 1;
        self.timer.cancel();
    }

    async fn on_dwell_elapsed(&mut self, cycle: u64) {
        if cycle != self.dwell_cycle || self.session != SessionState::DwellPending || !self.visible {
            trace!(cycle, "Ignoring stale dwell");
            return;
        }

        if self.gate.has_counted() {
            debug!(page_id = %self.page_id, "Session already counted elsewhere");
            self.session = SessionState::Counted;
            self.publish_snapshot();
            return;
        }

        // Claim the session before the round trip so a concurrent mount
        // in the same session cannot count too
        self.gate.mark_counted();
        match self.store.increment(&self.page_id).await {
            Ok(record) => {
                info!(page_id = %self.page_id, count = record.count, "View counted");
                self.session = SessionState::Counted;
                self.apply_count(record.count, "increment");
            }
            Err(err) => {
                self.gate.reset();
                warn!(
                    page_id = %self.page_id,
                    error = %err,
                    "Could not count view, will retry on next visit"
                );
            }
        }
        self.publish_snapshot();
    }

    fn on_change(&mut self, record: &CounterRecord) {
        trace!(%record, "Change notification");
        self.apply_count(record.count, "notification");
    }

    /// Show an authoritative count. The stored count never decreases, so a
    /// lower value than the one on screen was delivered out of order.
    fn apply_count(&mut self, count: u64, source: &'static str) {
        if let DisplayState::Ready(current) = self.display {
            if count < current {
                debug!(count, current, source, "Ignoring stale count");
                return;
            }
            if count == current {
                return;
            }
        }

        trace!(count, source, "Count updated");
        self.display = DisplayState::Ready(count);
        self.counts.send_replace(Some(count));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(SyncSnapshot {
            display: self.display,
            session: self.session,
            visible: self.visible,
            dwell_active: self.timer.is_active(),
        });
    }
}

async fn next_load(loading: &mut Option<LoadFuture>) -> Result<CounterRecord> {
    match loading {
        Some(load) => load.await,
        None => std::future::pending().await,
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<CounterRecord> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
