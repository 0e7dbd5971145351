//! Drives reconciliation from change events, scheduled wakeups, and resync.
//!
//! Records reconcile independently and concurrently; a single record never
//! runs two passes at once. A pass requested while one is already in flight
//! is coalesced into exactly one follow-up pass.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use api_types::UnitId;
use error_stack::Report;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ReconcileError;
use super::ReconcileOutcome;
use super::Reconciler;
use crate::store::ResourceStore;
use crate::store::UnitChange;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often every record is re-enqueued regardless of change events.
    /// This is what catches lease expiry when nothing touches the record.
    pub resync_interval: Duration,
    /// First retry delay after a failed pass.
    pub initial_retry_delay: Duration,
    /// Ceiling for the doubling retry delay.
    pub max_retry_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Result of one finished reconcile task.
struct Done {
    id: UnitId,
    result: Result<ReconcileOutcome, Report<ReconcileError>>,
}

pub struct ReconcileRunner {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ResourceStore>,
    config: RunnerConfig,
}

impl ReconcileRunner {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ResourceStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            config,
        }
    }

    /// Run until cancelled or the event channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<UnitChange>, token: CancellationToken) {
        info!(
            resync_secs = self.config.resync_interval.as_secs(),
            "Starting reconcile runner"
        );

        let (done_tx, mut done_rx) = mpsc::channel::<Done>(64);
        let mut state = RunnerState {
            reconciler: self.reconciler,
            config: self.config.clone(),
            wakeups: DelayQueue::new(),
            scheduled: HashMap::new(),
            in_flight: HashSet::new(),
            pending: HashSet::new(),
            retry_delays: HashMap::new(),
            done_tx,
        };

        // The first tick fires immediately, so startup begins with a full
        // pass over the pool.
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("Reconcile runner shutdown requested");
                    break;
                }
                change = events.recv() => match change {
                    Some(change) => state.kick(change.id),
                    None => {
                        info!("Store watch channel closed");
                        break;
                    }
                },
                Some(done) = done_rx.recv() => {
                    state.on_done(done);
                }
                _ = resync.tick() => {
                    match self.store.list().await {
                        Ok(records) => {
                            for record in records {
                                state.kick(record.id);
                            }
                        }
                        Err(err) => {
                            // Nothing to do but wait for the next tick.
                            error!("Resync listing failed: {err:?}");
                        }
                    }
                }
                Some(expired) = poll_fn(|cx| state.wakeups.poll_expired(cx)),
                    if !state.wakeups.is_empty() =>
                {
                    let id = expired.into_inner();
                    state.scheduled.remove(&id);
                    state.kick(id);
                }
            }
        }
    }
}

struct RunnerState {
    reconciler: Arc<Reconciler>,
    config: RunnerConfig,
    wakeups: DelayQueue<UnitId>,
    scheduled: HashMap<UnitId, Key>,
    in_flight: HashSet<UnitId>,
    pending: HashSet<UnitId>,
    retry_delays: HashMap<UnitId, Duration>,
    done_tx: mpsc::Sender<Done>,
}

impl RunnerState {
    /// Reconcile the record now, or coalesce if it is already in flight.
    fn kick(&mut self, id: UnitId) {
        // Reconciling now supersedes any scheduled wakeup.
        if let Some(key) = self.scheduled.remove(&id) {
            self.wakeups.remove(&key);
        }

        if self.in_flight.contains(&id) {
            self.pending.insert(id);
            return;
        }
        self.in_flight.insert(id.clone());

        let reconciler = self.reconciler.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = reconciler.reconcile(&id).await;
            // Fails only when the runner is shutting down.
            let _ = done_tx.send(Done { id, result }).await;
        });
    }

    fn on_done(&mut self, done: Done) {
        let Done { id, result } = done;
        self.in_flight.remove(&id);

        match result {
            Ok(outcome) => {
                self.retry_delays.remove(&id);
                match outcome {
                    ReconcileOutcome::Converged => {}
                    ReconcileOutcome::RequeueAfter(delay) => self.schedule(id.clone(), delay),
                }
            }
            Err(report) => {
                let delay = self.next_retry_delay(&id);
                warn!(
                    unit = %id,
                    delay_secs = delay.as_secs_f32(),
                    "reconcile failed, retrying after delay: {report:?}"
                );
                self.schedule(id.clone(), delay);
            }
        }

        // A change arrived while the pass was running; go again.
        if self.pending.remove(&id) {
            self.kick(id);
        }
    }

    fn schedule(&mut self, id: UnitId, delay: Duration) {
        if let Some(key) = self.scheduled.remove(&id) {
            self.wakeups.remove(&key);
        }
        let key = self.wakeups.insert(id.clone(), delay);
        self.scheduled.insert(id, key);
    }

    fn next_retry_delay(&mut self, id: &UnitId) -> Duration {
        let delay = self
            .retry_delays
            .get(id)
            .map(|last| std::cmp::min(*last * 2, self.config.max_retry_delay))
            .unwrap_or(self.config.initial_retry_delay);
        self.retry_delays.insert(id.clone(), delay);
        delay
    }
}
