//! Local mode: the full control loop against an in-memory store and
//! backend. Useful for demos and for poking at the admission endpoint
//! without a cluster.

use std::sync::Arc;

use anyhow::Result;
use api_types::PoolUnitSpec;
use api_types::UnitStatus;

use crate::app::AppConfig;
use crate::app::Application;
use crate::backend::MemoryBackend;
use crate::clock::SystemClock;
use crate::config::LocalArgs;
use crate::store::MemoryStore;

pub async fn run(args: LocalArgs) -> Result<()> {
    tracing::info!("Starting pool operator in local mode");

    let store = Arc::new(MemoryStore::new());
    for i in 0..args.units {
        // Seeded without status; the first reconcile pass initializes them.
        store.insert(
            &format!("unit-{i}"),
            PoolUnitSpec {
                max_ready_time_seconds: args.lease_secs,
                workload_image_ref: args.image.clone(),
            },
            UnitStatus::default(),
        );
    }
    tracing::info!(
        units = args.units,
        lease_secs = args.lease_secs,
        admission = %args.admission_listen_addr,
        "Seeded in-memory pool; POST / on the admission endpoint activates a unit"
    );

    let backend = Arc::new(MemoryBackend::new("local"));

    let app = Application::new(
        store,
        backend,
        Arc::new(SystemClock),
        AppConfig {
            admission_listen_addr: args.admission_listen_addr.clone(),
            runner: args.runner_config(),
            conflict_retry_budget: 3,
        },
    );

    app.run().await
}
