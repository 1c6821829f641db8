//! Logging configuration for viewcounter.
//!
//! Every store and session failure is swallowed at the synchronizer boundary
//! after being reported here, so the subscriber set up by [`init_logging`] is
//! the only place those failures become visible.
//!
//! Logs go to stderr; stdout is reserved for command output such as
//! `viewctr show --json`.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding filter directives. Falls back to `RUST_LOG`.
pub const LOG_ENV: &str = "VIEWCOUNTER_LOG";

/// Tracing targets owned by this project: the library and the `viewctr` binary.
const TARGETS: [&str; 2] = ["viewcounter", "viewctr"];

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only, plus the warnings raised when a view could not be
    /// loaded or counted.
    Quiet,
    /// Info and above.
    #[default]
    Normal,
    /// Debug and above: dwell starts and cancels, stale counts.
    Verbose,
    /// Everything, including each change notification.
    Trace,
}

impl Verbosity {
    /// Map `-q` and the number of `-v` flags to a verbosity. Quiet wins.
    #[must_use]
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter directives used when neither [`LOG_ENV`] nor `RUST_LOG` is set.
    #[must_use]
    pub fn default_directives(&self) -> String {
        let level = self.to_level_filter();
        let mut directives: Vec<String> = TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect();
        if *self == Self::Quiet {
            // A counter that silently stays on "Loading..." is worth a line
            directives.push(format!("viewcounter::sync={}", Level::WARN));
        }
        directives.join(",")
    }
}

/// Initialize the logging system.
///
/// Call once at startup. [`LOG_ENV`], then `RUST_LOG`, take precedence over
/// `verbosity`.
///
/// # Examples
///
/// ```no_run
/// use viewcounter::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directives()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbosity != Verbosity::Normal),
    );

    // Ignore the error if a subscriber is already installed
    let _ = subscriber.try_init();
}

/// Initialize logging for tests.
///
/// Only warnings and errors are shown by default to keep test output clean.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
