//! Per-record reconciliation state machine.
//!
//! Each pass re-reads the record, derives the next transition from its
//! lifecycle phase, applies at most one conditional status update, and tells
//! the runner when to come back. Concurrent writers are detected through
//! revision conflicts and answered by re-reading, never by overwriting.

use std::sync::Arc;
use std::time::Duration;

use api_types::UnitId;
use api_types::UnitPhase;
use api_types::UnitRecord;
use api_types::UnitState;
use api_types::UnitStatus;
use api_types::WorkloadRef;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashSet;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::WorkloadBackend;
use crate::clock::Clock;
use crate::store::ResourceStore;
use crate::store::StoreError;

pub mod runner;

/// Conditional-update attempts per pass before giving up on a record that
/// keeps changing under us.
const DEFAULT_CONFLICT_BUDGET: u32 = 3;

/// What the runner should do once a pass completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record converged (or is terminal); nothing further scheduled.
    Converged,
    /// Reconcile again no earlier than this far in the future.
    RequeueAfter(Duration),
}

/// Failures of a reconcile pass. All transient; the runner retries them
/// with backoff while other records keep reconciling.
#[derive(Debug, derive_more::Display)]
pub enum ReconcileError {
    #[display("record {id} changed concurrently")]
    Conflict { id: UnitId },
    #[display("record {id} kept changing concurrently, gave up after {attempts} attempts")]
    ConflictBudgetExhausted { id: UnitId, attempts: u32 },
    #[display("store access failed for record {id}")]
    Store { id: UnitId },
    #[display("workload backend failed for record {id}")]
    Backend { id: UnitId },
}

impl core::error::Error for ReconcileError {}

/// The per-record state machine.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn WorkloadBackend>,
    clock: Arc<dyn Clock>,
    conflict_budget: u32,
    /// Records already reported as misconfigured; diagnosed once, then left
    /// alone until their spec changes are picked up by a fresh process.
    diagnosed: DashSet<UnitId>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn WorkloadBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            backend,
            clock,
            conflict_budget: DEFAULT_CONFLICT_BUDGET,
            diagnosed: DashSet::new(),
        }
    }

    pub fn with_conflict_budget(mut self, budget: u32) -> Self {
        self.conflict_budget = budget.max(1);
        self
    }

    /// Reconcile one record to convergence or to a scheduling decision.
    ///
    /// A revision conflict aborts the write and forces a fresh
    /// fetch-and-retry of the same pass, bounded by the conflict budget.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::ConflictBudgetExhausted`] when concurrent writers
    ///   win every attempt
    /// - [`ReconcileError::Store`] / [`ReconcileError::Backend`] on
    ///   infrastructure failures, with the record left unchanged
    pub async fn reconcile(
        &self,
        id: &UnitId,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let report = match self.reconcile_once(id).await {
                Ok(outcome) => return Ok(outcome),
                Err(report) => report,
            };

            if !matches!(report.current_context(), ReconcileError::Conflict { .. }) {
                return Err(report);
            }
            if attempts >= self.conflict_budget {
                return Err(report.change_context(ReconcileError::ConflictBudgetExhausted {
                    id: id.clone(),
                    attempts,
                }));
            }
            debug!(unit = %id, attempts, "record changed concurrently, re-reading");
        }
    }

    async fn reconcile_once(
        &self,
        id: &UnitId,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let mut record = match self.store.get(id).await {
            Ok(record) => record,
            Err(report) => {
                if matches!(report.current_context(), StoreError::NotFound { .. }) {
                    // The record was deleted; terminal.
                    debug!(unit = %id, "record is gone, nothing to reconcile");
                    return Ok(ReconcileOutcome::Converged);
                }
                return Err(report.change_context(ReconcileError::Store { id: id.clone() }));
            }
        };

        if let Err(invalid) = record.spec.validate() {
            if self.diagnosed.insert(id.clone()) {
                error!(unit = %id, error = %invalid, "record spec is invalid, will not retry");
            }
            return Ok(ReconcileOutcome::Converged);
        }

        let now = self.clock.now();
        match record.status.phase() {
            UnitPhase::Uninitialized => {
                info!(unit = %id, "initializing new record");
                record.status = UnitStatus::initialized();
                self.persist(&record).await?;
                Ok(ReconcileOutcome::Converged)
            }
            UnitPhase::Inactive { .. } if record.status.requested => {
                self.activate(record, now).await
            }
            UnitPhase::Inactive {
                bound_workload: Some(stale),
            } => {
                // Leftover from a teardown that failed after the state flip.
                info!(unit = %id, workload = %stale, "removing stale workload from inactive record");
                self.backend
                    .delete(&stale)
                    .await
                    .change_context(ReconcileError::Backend { id: id.clone() })?;
                record.status.bound_workload = None;
                self.persist(&record).await?;
                Ok(ReconcileOutcome::Converged)
            }
            UnitPhase::Inactive { .. } => Ok(ReconcileOutcome::Converged),
            UnitPhase::Active {
                started_at,
                bound_workload,
            } => {
                // A missing start timestamp reads as the epoch: such a
                // record is expired on sight and torn down.
                let started_at = started_at.unwrap_or(DateTime::UNIX_EPOCH);
                let deadline = started_at + record.spec.lease();
                if now >= deadline {
                    self.deactivate(record, bound_workload).await
                } else {
                    let wait = (deadline - now).to_std().unwrap_or_default();
                    Ok(ReconcileOutcome::RequeueAfter(wait))
                }
            }
        }
    }

    /// Bind a requested record to a fresh workload and start its lease.
    async fn activate(
        &self,
        mut record: UnitRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        let workload = self
            .backend
            .create(&record.spec.workload_image_ref)
            .await
            .change_context(ReconcileError::Backend {
                id: record.id.clone(),
            })?;

        info!(unit = %record.id, workload = %workload, "workload created, activating record");
        record.status.state = Some(UnitState::Active);
        record.status.started_at = Some(now);
        record.status.bound_workload = Some(workload.clone());
        record.status.requested = false;

        match self.persist(&record).await {
            Ok(()) => {
                let lease = record.spec.lease().to_std().unwrap_or_default();
                Ok(ReconcileOutcome::RequeueAfter(lease))
            }
            Err(report) => {
                if matches!(report.current_context(), ReconcileError::Conflict { .. }) {
                    // The record moved under us after the workload was
                    // created; remove it so the retried pass starts clean.
                    if let Err(cleanup) = self.backend.delete(&workload).await {
                        warn!(
                            unit = %record.id,
                            workload = %workload,
                            "failed to remove workload after conflicting update: {cleanup:?}"
                        );
                    }
                }
                Err(report)
            }
        }
    }

    /// Tear down an expired record: delete the workload first, then clear
    /// the reference and return the record to the inactive pool.
    async fn deactivate(
        &self,
        mut record: UnitRecord,
        bound_workload: Option<WorkloadRef>,
    ) -> Result<ReconcileOutcome, Report<ReconcileError>> {
        if let Some(workload) = &bound_workload {
            self.backend
                .delete(workload)
                .await
                .change_context(ReconcileError::Backend {
                    id: record.id.clone(),
                })?;
            info!(unit = %record.id, workload = %workload, "expired workload deleted");
        }

        record.status.state = Some(UnitState::Inactive);
        record.status.bound_workload = None;
        record.status.requested = false;
        self.persist(&record).await?;
        Ok(ReconcileOutcome::Converged)
    }

    async fn persist(&self, record: &UnitRecord) -> Result<(), Report<ReconcileError>> {
        match self.store.update_status(record).await {
            Ok(_) => Ok(()),
            Err(report) => {
                let context = match report.current_context() {
                    // A record deleted mid-pass surfaces like any other
                    // concurrent write: the retried read settles it.
                    StoreError::Conflict { .. } | StoreError::NotFound { .. } => {
                        ReconcileError::Conflict {
                            id: record.id.clone(),
                        }
                    }
                    StoreError::Request { .. } => ReconcileError::Store {
                        id: record.id.clone(),
                    },
                };
                Err(report.change_context(context))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use api_types::PoolUnitSpec;
    use api_types::Revision;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::store::UnitChange;

    const LEASE_SECS: i64 = 120;

    fn spec() -> PoolUnitSpec {
        PoolUnitSpec {
            max_ready_time_seconds: LEASE_SECS,
            workload_image_ref: "registry.local/worker:v1".to_string(),
        }
    }

    fn start_time() -> DateTime<Utc> {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let backend = Arc::new(MemoryBackend::new("test"));
            let clock = Arc::new(ManualClock::at(start_time()));
            let reconciler =
                Reconciler::new(store.clone(), backend.clone(), clock.clone());
            Self {
                store,
                backend,
                clock,
                reconciler,
            }
        }

        async fn record(&self, id: &UnitId) -> UnitRecord {
            self.store.get(id).await.unwrap()
        }

        /// Seed an inactive record with `requested` already set.
        fn seed_requested(&self, name: &str) -> UnitId {
            let mut status = UnitStatus::initialized();
            status.requested = true;
            self.store.insert(name, spec(), status).id
        }

        /// Seed an active record and return the id with its live workload.
        async fn seed_active(&self, name: &str) -> (UnitId, WorkloadRef) {
            let workload = self.backend.create("registry.local/worker:v1").await.unwrap();
            let status = UnitStatus {
                state: Some(UnitState::Active),
                started_at: Some(start_time()),
                bound_workload: Some(workload.clone()),
                requested: false,
            };
            (self.store.insert(name, spec(), status).id, workload)
        }
    }

    #[tokio::test]
    async fn initializes_record_without_status() {
        let harness = Harness::new();
        let id = harness
            .store
            .insert("unit-a", spec(), UnitStatus::default())
            .id;

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Inactive));
        assert!(record.status.bound_workload.is_none());
        assert!(!record.status.requested);
    }

    #[tokio::test]
    async fn activates_requested_record() {
        let harness = Harness::new();
        let id = harness.seed_requested("unit-a");

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(LEASE_SECS as u64))
        );
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Active));
        assert_eq!(record.status.started_at, Some(start_time()));
        assert!(!record.status.requested, "request flag should be consumed");

        let workload = record.status.bound_workload.expect("workload bound");
        assert!(harness.backend.is_live(&workload));
    }

    #[tokio::test]
    async fn stays_active_until_the_deadline() {
        let harness = Harness::new();
        let (id, workload) = harness.seed_active("unit-a").await;

        harness
            .clock
            .advance(chrono::Duration::seconds(LEASE_SECS - 1));
        let writes_before = harness.store.status_writes();

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(Duration::from_secs(1))
        );
        assert!(harness.backend.is_live(&workload));
        assert_eq!(
            harness.store.status_writes(),
            writes_before,
            "a pass without a transition must not write"
        );
    }

    #[tokio::test]
    async fn tears_down_at_the_deadline_inclusive() {
        let harness = Harness::new();
        let (id, workload) = harness.seed_active("unit-a").await;

        harness.clock.advance(chrono::Duration::seconds(LEASE_SECS));
        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Inactive));
        assert!(record.status.bound_workload.is_none());
        assert!(!record.status.requested);
        assert!(!harness.backend.is_live(&workload));
    }

    #[tokio::test]
    async fn expiry_clears_a_pending_request() {
        let harness = Harness::new();
        let (id, _) = harness.seed_active("unit-a").await;

        // A request that raced in while the unit was active.
        let mut record = harness.record(&id).await;
        record.status.requested = true;
        harness.store.update_status(&record).await.unwrap();

        harness.clock.advance(chrono::Duration::seconds(LEASE_SECS));
        harness.reconciler.reconcile(&id).await.unwrap();

        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Inactive));
        assert!(!record.status.requested);
    }

    #[tokio::test]
    async fn active_without_start_time_expires_immediately() {
        let harness = Harness::new();
        let workload = harness.backend.create("registry.local/worker:v1").await.unwrap();
        let status = UnitStatus {
            state: Some(UnitState::Active),
            started_at: None,
            bound_workload: Some(workload.clone()),
            requested: false,
        };
        let id = harness.store.insert("unit-a", spec(), status).id;

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
        assert!(!harness.backend.is_live(&workload));
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Inactive));
    }

    #[tokio::test]
    async fn idempotent_pass_writes_nothing() {
        let harness = Harness::new();
        let id = harness
            .store
            .insert("unit-a", spec(), UnitStatus::initialized())
            .id;
        let writes_before = harness.store.status_writes();

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
        assert_eq!(harness.store.status_writes(), writes_before);
    }

    #[tokio::test]
    async fn removes_stale_workload_from_inactive_record() {
        let harness = Harness::new();
        let stale = harness.backend.create("registry.local/worker:v1").await.unwrap();
        let mut status = UnitStatus::initialized();
        status.bound_workload = Some(stale.clone());
        let id = harness.store.insert("unit-a", spec(), status).id;

        let outcome = harness.reconciler.reconcile(&id).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
        assert!(!harness.backend.is_live(&stale));
        let record = harness.record(&id).await;
        assert!(record.status.bound_workload.is_none());
    }

    #[tokio::test]
    async fn create_failure_leaves_record_unchanged() {
        let harness = Harness::new();
        let id = harness.seed_requested("unit-a");
        harness.backend.set_fail_creates(true);
        let writes_before = harness.store.status_writes();

        let report = harness.reconciler.reconcile(&id).await.unwrap_err();

        assert!(matches!(
            report.current_context(),
            ReconcileError::Backend { .. }
        ));
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Inactive));
        assert!(record.status.requested, "request must survive the failure");
        assert_eq!(harness.store.status_writes(), writes_before);
    }

    #[tokio::test]
    async fn delete_failure_leaves_record_active() {
        let harness = Harness::new();
        let (id, workload) = harness.seed_active("unit-a").await;
        harness.backend.set_fail_deletes(true);
        harness.clock.advance(chrono::Duration::seconds(LEASE_SECS));

        let report = harness.reconciler.reconcile(&id).await.unwrap_err();

        assert!(matches!(
            report.current_context(),
            ReconcileError::Backend { .. }
        ));
        let record = harness.record(&id).await;
        assert_eq!(record.status.state, Some(UnitState::Active));
        assert_eq!(record.status.bound_workload, Some(workload));

        // Once the backend recovers, the next pass converges.
        harness.backend.set_fail_deletes(false);
        let outcome = harness.reconciler.reconcile(&id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);
    }

    #[tokio::test]
    async fn missing_record_is_terminal() {
        let harness = Harness::new();

        let outcome = harness
            .reconciler
            .reconcile(&UnitId::from("never-created"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Converged);
    }

    #[tokio::test]
    async fn invalid_spec_is_diagnosed_not_retried() {
        let harness = Harness::new();
        let bad_spec = PoolUnitSpec {
            max_ready_time_seconds: -1,
            workload_image_ref: "registry.local/worker:v1".to_string(),
        };
        let id = harness
            .store
            .insert("unit-a", bad_spec, UnitStatus::default())
            .id;
        let writes_before = harness.store.status_writes();

        for _ in 0..2 {
            let outcome = harness.reconciler.reconcile(&id).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::Converged);
        }
        assert_eq!(
            harness.store.status_writes(),
            writes_before,
            "misconfigured records must never be mutated"
        );
    }

    /// Store wrapper that rejects the first `conflicts` status updates.
    struct ConflictingStore {
        inner: Arc<MemoryStore>,
        remaining: AtomicU32,
    }

    impl ConflictingStore {
        fn new(inner: Arc<MemoryStore>, conflicts: u32) -> Self {
            Self {
                inner,
                remaining: AtomicU32::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl ResourceStore for ConflictingStore {
        async fn get(&self, id: &UnitId) -> Result<UnitRecord, Report<StoreError>> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<UnitRecord>, Report<StoreError>> {
            self.inner.list().await
        }

        async fn update_status(
            &self,
            record: &UnitRecord,
        ) -> Result<Revision, Report<StoreError>> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Report::new(StoreError::Conflict {
                    id: record.id.clone(),
                }));
            }
            self.inner.update_status(record).await
        }

        async fn watch(
            &self,
            events: mpsc::Sender<UnitChange>,
            token: CancellationToken,
        ) -> Result<(), Report<StoreError>> {
            self.inner.watch(events, token).await
        }
    }

    #[tokio::test]
    async fn conflict_is_retried_with_a_fresh_read() {
        let inner = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryBackend::new("test"));
        let clock = Arc::new(ManualClock::at(start_time()));
        let mut status = UnitStatus::initialized();
        status.requested = true;
        let id = inner.insert("unit-a", spec(), status).id;

        let store = Arc::new(ConflictingStore::new(inner.clone(), 1));
        let reconciler = Reconciler::new(store, backend.clone(), clock);

        let outcome = reconciler.reconcile(&id).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::RequeueAfter(_)));
        let record = inner.get(&id).await.unwrap();
        assert_eq!(record.status.state, Some(UnitState::Active));
        // The workload created by the conflicting attempt was cleaned up.
        assert_eq!(backend.live_count(), 1);
    }

    #[tokio::test]
    async fn conflict_budget_bounds_the_retries() {
        let inner = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryBackend::new("test"));
        let clock = Arc::new(ManualClock::at(start_time()));
        let id = inner.insert("unit-a", spec(), UnitStatus::default()).id;

        let store = Arc::new(ConflictingStore::new(inner, u32::MAX));
        let reconciler = Reconciler::new(store, backend, clock).with_conflict_budget(3);

        let report = reconciler.reconcile(&id).await.unwrap_err();

        assert!(matches!(
            report.current_context(),
            ReconcileError::ConflictBudgetExhausted { attempts: 3, .. }
        ));
    }
}
