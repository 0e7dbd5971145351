use std::time::Duration;

use clap::Parser;

use crate::reconcile::runner::RunnerConfig;

#[derive(Parser, Clone)]
pub struct LocalArgs {
    #[arg(long, default_value = "4", help = "Number of pool units to seed")]
    pub units: usize,

    #[arg(
        long,
        default_value = "60",
        help = "Lease duration in seconds for the seeded units"
    )]
    pub lease_secs: i64,

    #[arg(
        long,
        default_value = "registry.local/pool-worker:latest",
        help = "Workload image recorded on the seeded units"
    )]
    pub image: String,

    #[arg(
        long,
        env = "ADMISSION_LISTEN_ADDR",
        default_value = "127.0.0.1:19090",
        help = "Admission endpoint listen address"
    )]
    pub admission_listen_addr: String,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between full resync passes over the pool"
    )]
    pub resync_interval_secs: u64,
}

impl LocalArgs {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            ..RunnerConfig::default()
        }
    }
}
