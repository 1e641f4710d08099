//! Command-line interface for the `vdest` binary.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::utils::LogFormat;

/// Sync document-chunk streams into a vector database.
#[derive(Debug, Parser)]
#[command(name = "vdest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log output format (logs are written to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check the connection and collection schema of a destination
    Check(commands::CheckArgs),

    /// Write JSONL messages into a destination
    Write(commands::WriteArgs),
}
