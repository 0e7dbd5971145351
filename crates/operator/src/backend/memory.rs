//! In-memory workload backend used by local mode and tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use api_types::WorkloadRef;
use async_trait::async_trait;
use dashmap::DashSet;
use error_stack::Report;
use tracing::debug;
use uuid::Uuid;

use super::BackendError;
use super::WorkloadBackend;

/// Backend that only tracks which workload identities are live.
///
/// Failure injection flips every create or delete into an infrastructure
/// error, which is how the reconcile tests exercise the retry paths.
pub struct MemoryBackend {
    namespace: String,
    live: DashSet<WorkloadRef>,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBackend {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            live: DashSet::new(),
            fail_creates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn is_live(&self, workload: &WorkloadRef) -> bool {
        self.live.contains(workload)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[async_trait]
impl WorkloadBackend for MemoryBackend {
    async fn create(&self, image: &str) -> Result<WorkloadRef, Report<BackendError>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Report::new(BackendError::CreateFailed {
                image: image.to_string(),
                message: "injected create failure".to_string(),
            }));
        }

        let workload = WorkloadRef::new(self.namespace.clone(), Uuid::new_v4().to_string());
        self.live.insert(workload.clone());
        debug!(workload = %workload, image, "workload registered");
        Ok(workload)
    }

    async fn delete(&self, workload: &WorkloadRef) -> Result<(), Report<BackendError>> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Report::new(BackendError::DeleteFailed {
                workload: workload.clone(),
                message: "injected delete failure".to_string(),
            }));
        }

        // Removing an absent workload is a successful no-op.
        self.live.remove(workload);
        debug!(workload = %workload, "workload removed");
        Ok(())
    }
}
