//! Check command implementation.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::cli::output::MessageWriter;
use crate::models::{ConnectionStatus, DestinationConfig, Message};
use crate::services::Destination;

/// Arguments for the check command.
#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Destination configuration file (JSON or TOML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,
}

/// Handle the check command: print one CONNECTION_STATUS message.
pub async fn handle_check(args: CheckArgs) -> Result<()> {
    let config = DestinationConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    let status = match Destination::new(&config) {
        Ok(destination) => destination.check().await,
        Err(e) => ConnectionStatus::failed(e.to_string()),
    };

    MessageWriter::stdout()
        .write(&Message::ConnectionStatus {
            connection_status: status,
        })
        .await
        .context("failed to write connection status")?;
    Ok(())
}
