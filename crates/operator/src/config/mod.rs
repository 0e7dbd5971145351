mod cli;
mod daemon;
mod local;

pub use cli::Cli;
pub use cli::Commands;
pub use daemon::DaemonArgs;
pub use local::LocalArgs;
