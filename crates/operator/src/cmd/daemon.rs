//! Kubernetes daemon mode.

use std::sync::Arc;

use anyhow::Result;
use api_types::POOL_UNIT_KIND;

use crate::app::AppConfig;
use crate::app::Application;
use crate::backend::KubePodBackend;
use crate::clock::SystemClock;
use crate::config::DaemonArgs;
use crate::kube_client;
use crate::store::KubeStore;

pub async fn run(args: DaemonArgs) -> Result<()> {
    tracing::info!(namespace = %args.namespace, "Starting pool operator daemon");

    let client = kube_client::init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|err| anyhow::anyhow!("failed to build Kubernetes client: {err:?}"))?;

    let store = Arc::new(KubeStore::new(
        client.clone(),
        &args.namespace,
        &POOL_UNIT_KIND,
    ));
    let backend = Arc::new(KubePodBackend::new(client, &args.namespace));

    let app = Application::new(
        store,
        backend,
        Arc::new(SystemClock),
        AppConfig {
            admission_listen_addr: args.admission_listen_addr.clone(),
            runner: args.runner_config(),
            conflict_retry_budget: args.conflict_retry_budget,
        },
    );

    app.run().await
}
