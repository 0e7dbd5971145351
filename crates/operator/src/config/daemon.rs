use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::reconcile::runner::RunnerConfig;

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to in-cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "POOL_NAMESPACE",
        default_value = "default",
        help = "Namespace holding the pool unit records and their backing workloads"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = "ADMISSION_LISTEN_ADDR",
        default_value = "0.0.0.0:19090",
        help = "Admission endpoint listen address"
    )]
    pub admission_listen_addr: String,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between full resync passes over the pool, used to catch lease expiry with no record change"
    )]
    pub resync_interval_secs: u64,

    #[arg(
        long,
        default_value = "3",
        help = "Conditional-update attempts per reconcile pass before surfacing a transient error"
    )]
    pub conflict_retry_budget: u32,

    #[arg(
        long,
        default_value = "1",
        help = "Initial delay in seconds before retrying a failed reconcile pass"
    )]
    pub initial_retry_delay_secs: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Upper bound in seconds for the exponential reconcile retry delay"
    )]
    pub max_retry_delay_secs: u64,
}

impl DaemonArgs {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            initial_retry_delay: Duration::from_secs(self.initial_retry_delay_secs),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
    }
}
