//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Show command arguments.
#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Use the dark-mode palette in JSON output
    #[arg(long)]
    pub dark: bool,
}

/// Increment command arguments.
#[derive(Debug, Args)]
pub struct IncrementCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Visit command arguments.
#[derive(Debug, Args)]
pub struct VisitCommand {
    /// Session id; visits sharing an id count at most once
    #[arg(short, long)]
    pub session: Option<String>,

    /// Leave the page after this many milliseconds instead of waiting for the count
    #[arg(long, value_name = "MS")]
    pub leave_after: Option<u64>,

    /// Output the final state as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Stop after this many changes
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Session commands.
#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// End a session so its next visit counts again
    End {
        /// Session id to end
        #[arg(short, long)]
        session: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to configuration file (uses default if not specified)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
