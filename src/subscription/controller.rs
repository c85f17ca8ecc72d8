//! Subscription controller
//!
//! One task per symbol owns the reconciler and is the only writer of the
//! book. Feed events, snapshot completions and refresh ticks are handled
//! sequentially by that task, so a projection never sees a half-applied
//! update.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::{FeedEvent, SnapshotSource, SubscriptionSettings, SyncStatus};
use crate::orderbook::{
    BookLevels, Budget, DepthProjector, DepthSync, DerivedBookView, OrderBook, SyncOutcome,
};
use crate::parser::{DepthSnapshot, DepthUpdate};
use crate::telemetry::{
    APPLIED_UPDATES, BUFFERED_EVENTS, DEPTH_EVENTS, MALFORMED_EVENTS, RESYNCS, SNAPSHOT_FAILURES,
};

/// Upper bound on the delay between snapshot retries
const MAX_SNAPSHOT_BACKOFF: Duration = Duration::from_secs(30);

/// Consumer side of a running subscription
///
/// Dropping the handle stops the subscription; [`unsubscribe`] does the
/// same and waits for the task to finish.
///
/// [`unsubscribe`]: SubscriptionHandle::unsubscribe
#[derive(Debug)]
pub struct SubscriptionHandle {
    symbol: String,
    book: Arc<RwLock<OrderBook>>,
    views: watch::Receiver<Option<DerivedBookView>>,
    status: watch::Receiver<SyncStatus>,
    budget: watch::Sender<Option<Budget>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Derived views, updated at most once per refresh interval
    pub fn views(&self) -> watch::Receiver<Option<DerivedBookView>> {
        self.views.clone()
    }

    pub fn latest_view(&self) -> Option<DerivedBookView> {
        self.views.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn status_updates(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Both sides of the book as of now, best price first
    pub async fn current_book(&self) -> BookLevels {
        self.book.read().await.levels()
    }

    /// Change the budget used for max buy/sell sizes
    pub fn set_budget(&self, budget: Option<Budget>) {
        self.budget.send_replace(budget);
    }

    /// Stop the subscription and wait until its task has exited
    pub async fn unsubscribe(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(symbol = %self.symbol, error = %e, "Subscription task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Start maintaining the book for `symbol` from `feed`
pub fn spawn_subscription(
    symbol: &str,
    feed: mpsc::Receiver<FeedEvent>,
    source: Arc<dyn SnapshotSource>,
    settings: SubscriptionSettings,
) -> SubscriptionHandle {
    let symbol = symbol.to_uppercase();
    let book = Arc::new(RwLock::new(OrderBook::new(&symbol)));
    let (views_tx, views_rx) = watch::channel(None);
    let (status_tx, status_rx) = watch::channel(SyncStatus::Unsynced);
    let (budget_tx, budget_rx) = watch::channel(settings.budget);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let mut sync = DepthSync::new(settings.scan_window);
    let gauge = BUFFERED_EVENTS.with_label_values(&[symbol.as_str()]);
    sync.buffer_mut()
        .subscribe(move |events: &[DepthUpdate], _: &DepthUpdate| gauge.set(events.len() as i64));

    let controller = Controller {
        symbol: symbol.clone(),
        source,
        projector: DepthProjector::new(settings.display_depth).with_budget(settings.budget),
        settings,
        book: book.clone(),
        sync,
        views: views_tx,
        status: status_tx,
        budget: budget_rx,
        snapshot_tx,
        epoch: 0,
        fetch_task: None,
        connected_before: false,
        gap_resyncs: 0,
        emitted_version: None,
    };

    let task = tokio::spawn(controller.run(feed, snapshot_rx, shutdown_rx));

    SubscriptionHandle {
        symbol,
        book,
        views: views_rx,
        status: status_rx,
        budget: budget_tx,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

#[derive(Debug)]
enum SnapshotResult {
    Ready(DepthSnapshot),
    Degraded { attempts: u32, error: String },
}

#[derive(Debug)]
struct SnapshotMessage {
    epoch: u64,
    result: SnapshotResult,
}

struct Controller {
    symbol: String,
    source: Arc<dyn SnapshotSource>,
    settings: SubscriptionSettings,
    book: Arc<RwLock<OrderBook>>,
    sync: DepthSync,
    projector: DepthProjector,
    views: watch::Sender<Option<DerivedBookView>>,
    status: watch::Sender<SyncStatus>,
    budget: watch::Receiver<Option<Budget>>,
    snapshot_tx: mpsc::Sender<SnapshotMessage>,
    /// Incremented whenever an outstanding fetch is superseded
    epoch: u64,
    fetch_task: Option<JoinHandle<()>>,
    connected_before: bool,
    /// Consecutive resyncs caused by sequence gaps since the last bridge
    gap_resyncs: u32,
    emitted_version: Option<u64>,
}

impl Controller {
    async fn run(
        mut self,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut snapshot_rx: mpsc::Receiver<SnapshotMessage>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(symbol = %self.symbol, "Subscription started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = feed.recv() => match event {
                    Some(event) => self.handle_feed(event).await,
                    None => {
                        warn!(symbol = %self.symbol, "Depth feed closed");
                        break;
                    }
                },
                Some(message) = snapshot_rx.recv() => self.handle_snapshot(message).await,
                _ = ticker.tick() => self.refresh().await,
            }
        }

        self.stop_fetch();
        self.set_status(SyncStatus::Unsynced);
        info!(symbol = %self.symbol, "Subscription stopped");
    }

    async fn handle_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => {
                if self.connected_before {
                    warn!(symbol = %self.symbol, "Feed reconnected, forcing resynchronization");
                    RESYNCS.with_label_values(&[self.symbol.as_str(), "reconnect"]).inc();
                } else {
                    info!(symbol = %self.symbol, "Feed connected, synchronizing");
                }
                self.connected_before = true;
                self.gap_resyncs = 0;
                self.start_resync();
            }
            FeedEvent::Disconnected(reason) => {
                warn!(symbol = %self.symbol, reason = %reason, "Feed disconnected");
                self.stop_fetch();
                self.sync.invalidate();
                BUFFERED_EVENTS.with_label_values(&[self.symbol.as_str()]).set(0);
                self.set_status(SyncStatus::Unsynced);
            }
            FeedEvent::Malformed(error) => {
                MALFORMED_EVENTS.with_label_values(&[self.symbol.as_str()]).inc();
                warn!(symbol = %self.symbol, error = %error, "Dropping malformed depth update");
            }
            FeedEvent::Depth(update) => {
                DEPTH_EVENTS.with_label_values(&[self.symbol.as_str()]).inc();
                if !update.symbol.eq_ignore_ascii_case(&self.symbol) {
                    MALFORMED_EVENTS.with_label_values(&[self.symbol.as_str()]).inc();
                    warn!(
                        symbol = %self.symbol,
                        got = %update.symbol,
                        "Dropping depth update for another symbol"
                    );
                    return;
                }

                let outcome = {
                    let mut book = self.book.write().await;
                    self.sync.on_event(&mut book, update)
                };
                self.handle_outcome(outcome);
            }
        }
    }

    async fn handle_snapshot(&mut self, message: SnapshotMessage) {
        if message.epoch != self.epoch {
            debug!(
                symbol = %self.symbol,
                epoch = message.epoch,
                current = self.epoch,
                "Discarding snapshot from superseded request"
            );
            return;
        }

        match message.result {
            SnapshotResult::Ready(snapshot) => {
                self.fetch_task = None;
                let outcome = {
                    let mut book = self.book.write().await;
                    self.sync.seed(&mut book, &snapshot)
                };
                info!(
                    symbol = %self.symbol,
                    last_update_id = snapshot.last_update_id,
                    buffered = self.sync.buffered(),
                    "Order book seeded from snapshot"
                );
                self.set_status(self.unsettled_status(SyncStatus::Scanning));
                self.handle_outcome(outcome);
            }
            SnapshotResult::Degraded { attempts, error } => {
                error!(
                    symbol = %self.symbol,
                    attempts,
                    error = %error,
                    "Snapshot requests keep failing, order book degraded"
                );
                self.set_status(SyncStatus::Degraded);
            }
        }
    }

    fn handle_outcome(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Buffered => {}
            SyncOutcome::Bridged { cursor, applied } => {
                APPLIED_UPDATES
                    .with_label_values(&[self.symbol.as_str()])
                    .inc_by(applied as u64);
                info!(symbol = %self.symbol, cursor, applied, "Order book synchronized");
                self.gap_resyncs = 0;
                self.set_status(SyncStatus::Synced);
            }
            SyncOutcome::Applied { cursor } => {
                APPLIED_UPDATES.with_label_values(&[self.symbol.as_str()]).inc();
                trace!(symbol = %self.symbol, cursor, "Depth update applied");
            }
            SyncOutcome::Resync(gap) => {
                warn!(symbol = %self.symbol, gap = %gap, "Sequence gap, resynchronizing");
                RESYNCS.with_label_values(&[self.symbol.as_str(), gap.reason()]).inc();
                self.gap_resyncs += 1;
                if self.gap_resyncs == self.degraded_threshold() {
                    error!(
                        symbol = %self.symbol,
                        resyncs = self.gap_resyncs,
                        "Order book keeps losing sequence, degraded"
                    );
                }
                self.start_resync();
            }
        }
    }

    /// Emit a new view if the book or the budget changed since the last one
    async fn refresh(&mut self) {
        let budget_changed = self.budget.has_changed().unwrap_or(false);
        if budget_changed {
            let budget = *self.budget.borrow_and_update();
            self.projector.set_budget(budget);
        }

        let book = self.book.read().await;
        let version = book.version();
        if version == 0 || (!budget_changed && self.emitted_version == Some(version)) {
            return;
        }

        let view = self.projector.project(&book);
        drop(book);

        trace!(
            symbol = %self.symbol,
            last_update_id = view.last_update_id,
            bid_depth = %view.bid_depth,
            ask_depth = %view.ask_depth,
            "Depth view refreshed"
        );
        self.emitted_version = Some(version);
        self.views.send_replace(Some(view));
    }

    /// Throw away sync progress and request a fresh snapshot
    ///
    /// Back-to-back gap resyncs wait out the snapshot backoff before
    /// fetching again.
    fn start_resync(&mut self) {
        self.stop_fetch();
        self.sync.invalidate();
        BUFFERED_EVENTS.with_label_values(&[self.symbol.as_str()]).set(0);
        self.set_status(self.unsettled_status(SyncStatus::Unsynced));

        let delay = match self.gap_resyncs {
            0 => Duration::ZERO,
            n => snapshot_backoff(self.settings.snapshot_retry_delay, n),
        };
        if !delay.is_zero() {
            debug!(
                symbol = %self.symbol,
                resyncs = self.gap_resyncs,
                delay_ms = delay.as_millis() as u64,
                "Delaying snapshot request after repeated gaps"
            );
        }

        let job = FetchJob {
            source: self.source.clone(),
            symbol: self.symbol.clone(),
            limit: self.settings.snapshot_limit,
            delay,
            retry_delay: self.settings.snapshot_retry_delay,
            max_retries: self.degraded_threshold(),
            epoch: self.epoch,
            tx: self.snapshot_tx.clone(),
        };
        self.fetch_task = Some(tokio::spawn(job.run()));
    }

    /// Cancel any outstanding fetch; late results are ignored by epoch
    fn stop_fetch(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.epoch += 1;
    }

    fn degraded_threshold(&self) -> u32 {
        self.settings.snapshot_max_retries.max(1)
    }

    /// Status to report while not synced; repeated gaps keep it degraded
    fn unsettled_status(&self, status: SyncStatus) -> SyncStatus {
        if self.gap_resyncs >= self.degraded_threshold() {
            SyncStatus::Degraded
        } else {
            status
        }
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(symbol = %self.symbol, from = ?*current, to = ?status, "Sync status changed");
                *current = status;
                true
            }
        });
    }
}

struct FetchJob {
    source: Arc<dyn SnapshotSource>,
    symbol: String,
    limit: u32,
    /// Wait before the first attempt
    delay: Duration,
    retry_delay: Duration,
    max_retries: u32,
    epoch: u64,
    tx: mpsc::Sender<SnapshotMessage>,
}

impl FetchJob {
    /// Retry until a snapshot arrives or the subscription goes away
    async fn run(self) {
        let mut attempts = 0u32;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        loop {
            if self.tx.is_closed() {
                return;
            }

            match self.source.fetch_snapshot(&self.symbol, self.limit).await {
                Ok(snapshot) => {
                    let _ = self
                        .tx
                        .send(SnapshotMessage {
                            epoch: self.epoch,
                            result: SnapshotResult::Ready(snapshot),
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    SNAPSHOT_FAILURES.with_label_values(&[self.symbol.as_str()]).inc();

                    let delay = snapshot_backoff(self.retry_delay, attempts);
                    warn!(
                        symbol = %self.symbol,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Snapshot request failed, retrying"
                    );

                    if attempts == self.max_retries {
                        let degraded = SnapshotMessage {
                            epoch: self.epoch,
                            result: SnapshotResult::Degraded {
                                attempts,
                                error: e.to_string(),
                            },
                        };
                        if self.tx.send(degraded).await.is_err() {
                            return;
                        }
                    }

                    sleep(delay).await;
                }
            }
        }
    }
}

fn snapshot_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.pow(attempt.min(6)))
        .min(MAX_SNAPSHOT_BACKOFF)
}
