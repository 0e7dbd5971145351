//! Durable record store contracts and implementations.

use api_types::Revision;
use api_types::UnitId;
use api_types::UnitRecord;
use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod k8s;
pub mod memory;

pub use k8s::KubeStore;
pub use memory::MemoryStore;

/// Change notification pushed by a store watch.
///
/// Carries only the record id; consumers re-fetch before acting, so a stale
/// notification is harmless.
#[derive(Debug, Clone)]
pub struct UnitChange {
    pub id: UnitId,
}

/// Errors surfaced by record store operations.
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    /// The record does not exist. Callers treat this as already-converged
    /// state rather than a failure.
    #[display("record not found: {id}")]
    NotFound { id: UnitId },
    /// The record changed since it was read. Re-read and re-derive before
    /// writing again.
    #[display("revision conflict updating record {id}")]
    Conflict { id: UnitId },
    /// I/O failure talking to the store.
    #[display("store request failed: {message}")]
    Request { message: String },
}

impl core::error::Error for StoreError {}

/// Durable key-value store of pool unit records.
///
/// The store is the single source of truth shared by the reconcile loop and
/// the admission scheduler; every mutation is a conditional update against
/// the revision the record was read at.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch one record by id.
    async fn get(&self, id: &UnitId) -> Result<UnitRecord, Report<StoreError>>;

    /// List all records in store order.
    ///
    /// The admission scheduler treats the order as stable enough for one
    /// scan; no stronger guarantee is assumed.
    async fn list(&self) -> Result<Vec<UnitRecord>, Report<StoreError>>;

    /// Conditionally persist the record's status against its revision.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if another writer updated the record since
    ///   it was read
    /// - [`StoreError::NotFound`] if the record was deleted in the meantime
    async fn update_status(&self, record: &UnitRecord) -> Result<Revision, Report<StoreError>>;

    /// Push change notifications into `events` until cancelled.
    ///
    /// The watch is push-only. Deadline-driven transitions produce no store
    /// change, so the reconcile runner additionally resyncs the whole pool
    /// on a timer.
    async fn watch(
        &self,
        events: mpsc::Sender<UnitChange>,
        token: CancellationToken,
    ) -> Result<(), Report<StoreError>>;
}
