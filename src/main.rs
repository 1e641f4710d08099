use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::warn;

use vector_destinations::cli::commands::{handle_check, handle_write};
use vector_destinations::cli::{Cli, Commands};
use vector_destinations::utils::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    tokio::select! {
        result = run_command(cli.command) => {
            result?;
        }
        _ = shutdown_signal() => {
            // Unflushed records were never acknowledged, so the source resends them.
            warn!("received shutdown signal, abandoning buffered records");
        }
    }

    Ok(())
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Check(args) => handle_check(args).await,
        Commands::Write(args) => handle_write(args).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
