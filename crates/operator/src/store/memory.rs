//! In-memory record store used by local mode and tests.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use api_types::PoolUnitSpec;
use api_types::Revision;
use api_types::UnitId;
use api_types::UnitRecord;
use api_types::UnitStatus;
use async_trait::async_trait;
use error_stack::Report;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::ResourceStore;
use super::StoreError;
use super::UnitChange;

/// Thread-safe in-memory store with integer revisions.
///
/// Records are kept in insertion order, which is the listing order the
/// admission scheduler scans in. A status write counter is exposed so tests
/// can assert that converged reconcile passes persist nothing.
pub struct MemoryStore {
    records: Mutex<Vec<UnitRecord>>,
    next_revision: AtomicU64,
    status_writes: AtomicU64,
    changes: broadcast::Sender<UnitChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(Vec::new()),
            next_revision: AtomicU64::new(1),
            status_writes: AtomicU64::new(0),
            changes,
        }
    }

    /// Create a record, as the external pool owner would.
    ///
    /// Pass `UnitStatus::default()` for a freshly created record that the
    /// reconcile loop has not initialized yet.
    pub fn insert(&self, name: &str, spec: PoolUnitSpec, status: UnitStatus) -> UnitRecord {
        let record = UnitRecord {
            id: UnitId::from(name),
            spec,
            status,
            revision: self.fresh_revision(),
        };
        {
            let mut records = self.records.lock().expect("store lock poisoned");
            records.push(record.clone());
        }
        self.notify(record.id.clone());
        record
    }

    /// Delete a record, as the external pool owner would.
    pub fn remove(&self, id: &UnitId) {
        {
            let mut records = self.records.lock().expect("store lock poisoned");
            records.retain(|record| &record.id != id);
        }
        self.notify(id.clone());
    }

    /// Number of status updates persisted so far.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn fresh_revision(&self) -> Revision {
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        Revision::new(revision.to_string())
    }

    fn notify(&self, id: UnitId) {
        // Send fails only when nobody is watching, which is fine.
        let _ = self.changes.send(UnitChange { id });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, id: &UnitId) -> Result<UnitRecord, Report<StoreError>> {
        let records = self.records.lock().expect("store lock poisoned");
        records
            .iter()
            .find(|record| &record.id == id)
            .cloned()
            .ok_or_else(|| Report::new(StoreError::NotFound { id: id.clone() }))
    }

    async fn list(&self) -> Result<Vec<UnitRecord>, Report<StoreError>> {
        let records = self.records.lock().expect("store lock poisoned");
        Ok(records.clone())
    }

    async fn update_status(&self, record: &UnitRecord) -> Result<Revision, Report<StoreError>> {
        let revision = self.fresh_revision();
        {
            let mut records = self.records.lock().expect("store lock poisoned");
            let existing = records
                .iter_mut()
                .find(|existing| existing.id == record.id)
                .ok_or_else(|| {
                    Report::new(StoreError::NotFound {
                        id: record.id.clone(),
                    })
                })?;

            if existing.revision != record.revision {
                return Err(Report::new(StoreError::Conflict {
                    id: record.id.clone(),
                }));
            }

            existing.status = record.status.clone();
            existing.revision = revision.clone();
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(record.id.clone());
        Ok(revision)
    }

    async fn watch(
        &self,
        events: mpsc::Sender<UnitChange>,
        token: CancellationToken,
    ) -> Result<(), Report<StoreError>> {
        let mut changes = self.changes.subscribe();
        loop {
            select! {
                _ = token.cancelled() => {
                    info!("memory store watch shutdown requested");
                    break;
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        if events.send(change).await.is_err() {
                            // Receiver side is gone, nothing left to notify.
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped notifications are recovered by resync.
                        warn!(missed, "memory store watch lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use api_types::UnitState;
    use similar_asserts::assert_eq;

    use super::*;

    fn spec() -> PoolUnitSpec {
        PoolUnitSpec {
            max_ready_time_seconds: 60,
            workload_image_ref: "registry.local/worker:v1".to_string(),
        }
    }

    #[tokio::test]
    async fn update_with_current_revision_succeeds() {
        let store = MemoryStore::new();
        let mut record = store.insert("unit-a", spec(), UnitStatus::default());

        record.status = UnitStatus::initialized();
        let new_revision = store.update_status(&record).await.unwrap();

        let reread = store.get(&record.id).await.unwrap();
        assert_eq!(reread.revision, new_revision);
        assert_eq!(reread.status.state, Some(UnitState::Inactive));
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn update_with_stale_revision_conflicts() {
        let store = MemoryStore::new();
        let stale = store.insert("unit-a", spec(), UnitStatus::default());

        let mut fresh = store.get(&stale.id).await.unwrap();
        fresh.status.requested = true;
        store.update_status(&fresh).await.unwrap();

        let mut from_stale = stale.clone();
        from_stale.status = UnitStatus::initialized();
        let report = store.update_status(&from_stale).await.unwrap_err();
        assert!(matches!(
            report.current_context(),
            StoreError::Conflict { .. }
        ));

        // The conflicting write must not have landed.
        let reread = store.get(&stale.id).await.unwrap();
        assert!(reread.status.requested);
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let store = MemoryStore::new();
        store.insert("unit-b", spec(), UnitStatus::default());
        store.insert("unit-a", spec(), UnitStatus::default());
        store.insert("unit-c", spec(), UnitStatus::default());

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.id.0)
            .collect();
        assert_eq!(ids, vec!["unit-b", "unit-a", "unit-c"]);
    }

    #[tokio::test]
    async fn watch_forwards_changes() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let watch = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move { store.watch(tx, token).await })
        };

        // Let the watch task subscribe before producing the change.
        tokio::task::yield_now().await;

        store.insert("unit-a", spec(), UnitStatus::default());
        let change = rx.recv().await.unwrap();
        assert_eq!(change.id, UnitId::from("unit-a"));

        token.cancel();
        watch.await.unwrap().unwrap();
    }
}
