//! Kubernetes-backed record store.
//!
//! Pool unit records are persisted as namespaced custom resources. The
//! optimistic-concurrency token is the object's `resourceVersion`: status
//! replacement carries the version the record was read at, and the API
//! server rejects the write with a conflict when it moved.

use std::time::Duration;

use api_types::PoolUnit;
use api_types::RecordKind;
use api_types::Revision;
use api_types::UnitId;
use api_types::UnitRecord;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ResourceStore;
use super::StoreError;
use super::UnitChange;

/// Record store backed by the Kubernetes API.
pub struct KubeStore {
    api: Api<PoolUnit>,
    kind: RecordKind,
    namespace: String,
}

impl KubeStore {
    /// Build a store client serving one record kind in one namespace.
    ///
    /// The kind entry comes from the statically-initialized record-kind
    /// table; nothing is registered process-wide.
    pub fn new(client: Client, namespace: &str, kind: &RecordKind) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            kind: *kind,
            namespace: namespace.to_string(),
        }
    }

    fn request_error(&self, op: &str, err: &kube::Error) -> Report<StoreError> {
        Report::new(StoreError::Request {
            message: format!(
                "{op} {plural}.{group} in {namespace}: {err}",
                plural = self.kind.plural,
                group = self.kind.group,
                namespace = self.namespace,
            ),
        })
    }

    /// Watch the record stream once; returns when it ends or fails.
    async fn watch_records(
        &self,
        events: &mpsc::Sender<UnitChange>,
    ) -> Result<(), Report<StoreError>> {
        let mut stream = watcher(self.api.clone(), Config::default())
            .touched_objects()
            .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(unit) => {
                    let change = UnitChange {
                        id: UnitId(unit.name_any()),
                    };
                    if events.send(change).await.is_err() {
                        // Receiver side shut down first.
                        return Ok(());
                    }
                }
                Err(err) => {
                    return Err(Report::new(StoreError::Request {
                        message: format!("watch stream error: {err}"),
                    }));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, id: &UnitId) -> Result<UnitRecord, Report<StoreError>> {
        match self.api.get(&id.0).await {
            Ok(unit) => Ok(unit.into()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(Report::new(StoreError::NotFound { id: id.clone() }))
            }
            Err(err) => Err(self.request_error("get", &err)),
        }
    }

    async fn list(&self) -> Result<Vec<UnitRecord>, Report<StoreError>> {
        let units = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|err| self.request_error("list", &err))?;

        Ok(units.items.into_iter().map(UnitRecord::from).collect())
    }

    async fn update_status(&self, record: &UnitRecord) -> Result<Revision, Report<StoreError>> {
        let mut unit = PoolUnit::new(&record.id.0, record.spec.clone());
        unit.metadata.namespace = Some(self.namespace.clone());
        unit.metadata.resource_version = Some(record.revision.as_str().to_string());
        unit.status = Some(record.status.clone());

        let body = serde_json::to_vec(&unit).change_context(StoreError::Request {
            message: format!("serialize status of record {}", record.id),
        })?;

        match self
            .api
            .replace_status(&record.id.0, &PostParams::default(), body)
            .await
        {
            Ok(updated) => Ok(Revision::new(updated.resource_version().unwrap_or_default())),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(Report::new(StoreError::Conflict {
                    id: record.id.clone(),
                }))
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(Report::new(StoreError::NotFound {
                    id: record.id.clone(),
                }))
            }
            Err(err) => Err(self.request_error("update status of", &err)),
        }
    }

    /// Watch records for changes until cancelled, restarting the stream when
    /// it ends or fails.
    async fn watch(
        &self,
        events: mpsc::Sender<UnitChange>,
        token: CancellationToken,
    ) -> Result<(), Report<StoreError>> {
        info!(
            namespace = %self.namespace,
            kind = self.kind.kind,
            "Starting record watch"
        );
        loop {
            select! {
                _ = token.cancelled() => {
                    info!("Record watch shutdown requested");
                    break;
                }
                result = self.watch_records(&events) => {
                    match result {
                        Ok(()) => {
                            warn!("Record watch stream ended unexpectedly, restarting...");
                        }
                        Err(err) => {
                            error!("Record watch failed: {err:?}");
                            // Wait before retrying
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
