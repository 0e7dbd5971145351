//! Application wiring: spawns the record watch, the reconcile runner, and
//! the admission server, then supervises them until shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionScheduler;
use crate::admission::AdmissionServer;
use crate::backend::WorkloadBackend;
use crate::clock::Clock;
use crate::reconcile::runner::ReconcileRunner;
use crate::reconcile::runner::RunnerConfig;
use crate::reconcile::Reconciler;
use crate::store::ResourceStore;
use crate::store::UnitChange;

pub struct AppConfig {
    pub admission_listen_addr: String,
    pub runner: RunnerConfig,
    pub conflict_retry_budget: u32,
}

/// Application core, holding the store and backend the tasks share.
pub struct Application {
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn WorkloadBackend>,
    clock: Arc<dyn Clock>,
    config: AppConfig,
}

impl Application {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn WorkloadBackend>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            backend,
            clock,
            config,
        }
    }

    /// Start all background tasks and wait for completion or Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let token = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel::<UnitChange>(32);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Record watch task
        let watch_task = {
            let store = self.store.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting record watch task");
                if let Err(err) = store.watch(event_tx, token).await {
                    tracing::error!("Record watch failed: {err:?}");
                } else {
                    tracing::info!("Record watch task completed");
                }
            })
        };
        tasks.push(watch_task);

        // Reconcile runner task
        let runner_task = {
            let reconciler = Arc::new(
                Reconciler::new(self.store.clone(), self.backend.clone(), self.clock.clone())
                    .with_conflict_budget(self.config.conflict_retry_budget),
            );
            let runner =
                ReconcileRunner::new(reconciler, self.store.clone(), self.config.runner.clone());
            let token = token.clone();
            tokio::spawn(async move {
                runner.run(event_rx, token).await;
                tracing::info!("Reconcile runner task completed");
            })
        };
        tasks.push(runner_task);

        // Admission server task
        let admission_task = {
            let scheduler = Arc::new(AdmissionScheduler::new(self.store.clone()));
            let server = AdmissionServer::new(
                scheduler,
                self.config.admission_listen_addr.clone(),
            );
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(err) = server.run(token).await {
                    tracing::error!("Admission server failed: {err:?}");
                } else {
                    tracing::info!("Admission server task completed");
                }
            })
        };
        tasks.push(admission_task);

        tracing::info!("All application tasks started successfully");
        wait_for_completion(tasks, token).await
    }
}

/// Wait until a task exits or Ctrl+C arrives, then cancel and drain the
/// remaining tasks.
async fn wait_for_completion(
    mut tasks: Vec<JoinHandle<()>>,
    token: CancellationToken,
) -> Result<()> {
    tokio::select! {
        result = async {
            while let Some(task) = tasks.pop() {
                if let Ok(result) = task.await {
                    return Some(result);
                }
            }
            None
        } => {
            if result.is_some() {
                tracing::error!("A task completed unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
    }

    tracing::info!("Cancelling all tasks...");
    token.cancel();

    futures::future::join_all(tasks).await;

    Ok(())
}
