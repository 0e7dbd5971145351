use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;
use crate::config::local::LocalArgs;

#[derive(Parser)]
#[command(name = "operator", about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pool controller against a Kubernetes cluster
    Daemon(Box<DaemonArgs>),
    /// Run the pool controller against an in-memory store and backend
    Local(LocalArgs),
    /// Print the PoolUnit custom resource definition as YAML
    Crd,
}
