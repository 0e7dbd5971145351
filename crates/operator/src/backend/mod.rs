//! Workload backend contracts and implementations.

use api_types::WorkloadRef;
use async_trait::async_trait;
use error_stack::Report;

pub mod k8s;
pub mod memory;

pub use k8s::KubePodBackend;
pub use memory::MemoryBackend;

/// Errors surfaced by the workload backend. Always infrastructure failures;
/// both operations are safe to retry.
#[derive(Debug, derive_more::Display)]
pub enum BackendError {
    #[display("failed to create workload from image {image}: {message}")]
    CreateFailed { image: String, message: String },
    #[display("failed to delete workload {workload}: {message}")]
    DeleteFailed {
        workload: WorkloadRef,
        message: String,
    },
}

impl core::error::Error for BackendError {}

/// Creates and deletes the backing compute units bound to pool records.
#[async_trait]
pub trait WorkloadBackend: Send + Sync + 'static {
    /// Create a backing workload from an opaque image descriptor.
    ///
    /// Every attempt uses a fresh unique workload identity, so a retry after
    /// a failure can never collide with a previous attempt.
    async fn create(&self, image: &str) -> Result<WorkloadRef, Report<BackendError>>;

    /// Delete a backing workload. Deleting an already-absent workload is a
    /// no-op success.
    async fn delete(&self, workload: &WorkloadRef) -> Result<(), Report<BackendError>>;
}
