use anyhow::Result;
use clap::Parser;

use operator::cmd;
use operator::config::Cli;
use operator::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => {
            utils::logging::init();
            cmd::daemon::run(*daemon_args).await
        }
        Commands::Local(local_args) => {
            utils::logging::init();
            cmd::local::run(local_args).await
        }
        Commands::Crd => cmd::crd::run(),
    }
}
