//! Command-line interface for viewcounter.
//!
//! This module provides the CLI structure for the `viewctr` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, IncrementCommand, SessionCommand, ShowCommand, StatusCommand, VisitCommand,
    WatchCommand,
};

/// viewctr - Shared page-view counter
///
/// Reads, counts and watches a view tally shared by every visitor of a page.
/// A visit counts once per session, and only after the visitor stays long
/// enough.
#[derive(Debug, Parser)]
#[command(name = "viewctr")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Page to operate on (overrides `store.page_id`)
    #[arg(short, long, global = true, value_name = "ID")]
    pub page: Option<String>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the current count
    Show(ShowCommand),

    /// Add one view unconditionally
    Increment(IncrementCommand),

    /// Simulate a visit: dwell, count once per session, follow live updates
    Visit(VisitCommand),

    /// Print every change to the count as it happens
    Watch(WatchCommand),

    /// Show store and session status
    Status(StatusCommand),

    /// Manage visitor sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}
