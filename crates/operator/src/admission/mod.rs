//! Request-time selection among inactive pool records.

use std::sync::Arc;

use api_types::UnitId;
use api_types::UnitPhase;
use error_stack::Report;
use tracing::debug;
use tracing::info;

use crate::store::ResourceStore;
use crate::store::StoreError;

pub mod server;

pub use server::AdmissionServer;

/// Result of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// This record was flipped to requested; the reconcile loop takes it
    /// from here.
    Accepted(UnitId),
    /// No inactive, unrequested record exists right now.
    Busy,
}

/// Stateless first-fit selection over the record pool.
///
/// The scan takes the first eligible record in store order; there is no
/// rotating cursor, so repeated low-concurrency calls favor records early
/// in the listing.
pub struct AdmissionScheduler {
    store: Arc<dyn ResourceStore>,
}

impl AdmissionScheduler {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// One pass over the pool: mark the first inactive, unrequested record
    /// as requested.
    ///
    /// A candidate that changes between listing and update is skipped in
    /// favor of the next one; the same candidate is never retried within a
    /// pass.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Request`] if the pool cannot be listed or a write
    ///   fails for reasons other than a lost race
    pub async fn schedule(&self) -> Result<AdmissionDecision, Report<StoreError>> {
        let records = self.store.list().await?;
        let pool_size = records.len();

        for mut record in records {
            let eligible = matches!(record.status.phase(), UnitPhase::Inactive { .. })
                && !record.status.requested;
            if !eligible {
                continue;
            }

            record.status.requested = true;
            match self.store.update_status(&record).await {
                Ok(_) => {
                    info!(unit = %record.id, "record marked as requested");
                    return Ok(AdmissionDecision::Accepted(record.id));
                }
                Err(report) => match report.current_context() {
                    StoreError::Conflict { .. } | StoreError::NotFound { .. } => {
                        debug!(unit = %record.id, "candidate changed mid-scan, trying next");
                        continue;
                    }
                    StoreError::Request { .. } => return Err(report),
                },
            }
        }

        debug!(pool_size, "no eligible record in the pool");
        Ok(AdmissionDecision::Busy)
    }
}
