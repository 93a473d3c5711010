//! Logging setup shared by the CLI and embedding applications.
//!
//! Everything goes to stderr so a JSON run report on stdout stays parseable.
//! `sqlx` is capped at WARN unless overridden: at DEBUG it logs one statement
//! per rewritten row. Log lines carry table and column names and counts,
//! never column values.

use crate::error::AnonymiseError;
use crate::Result;
use tracing_subscriber::EnvFilter;

/// Environment variable holding filter directives that replace the
/// verbosity flags, e.g. `DBANON_LOG=dbanon_core=trace,sqlx=debug`.
pub const LOG_ENV: &str = "DBANON_LOG";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line, including the run span's `run_id`
    Json,
}

/// Filter directives for the given flags, unless `env` supplies its own.
fn directives(verbose: u8, quiet: bool, env: Option<&str>) -> String {
    if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
        return env.to_string();
    }
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    format!("{},sqlx=warn", level)
}

/// Initializes structured logging on stderr.
///
/// # Arguments
/// * `verbose` - Verbosity level (0=INFO, 1=DEBUG, 2+=TRACE)
/// * `quiet` - If true, only show ERROR level logs
/// * `format` - Text or JSON lines
///
/// [`LOG_ENV`] takes precedence over `verbose` and `quiet` when set.
///
/// # Example
/// ```rust,no_run
/// use dbanon_core::logging::{LogFormat, init_logging};
///
/// init_logging(1, false, LogFormat::Text).expect("Failed to initialize logging");
/// ```
pub fn init_logging(verbose: u8, quiet: bool, format: LogFormat) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = EnvFilter::try_new(directives(verbose, quiet, env.as_deref())).map_err(|e| {
        AnonymiseError::configuration(format!("invalid {} directives: {}", LOG_ENV, e))
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.map_err(|e| {
        AnonymiseError::configuration(format!("Failed to initialize logging: {}", e))
    })
}
