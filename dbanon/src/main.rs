//! Produces an anonymised copy of a media-library SQLite store.
//!
//! The copy keeps row counts, keys, folder tree shape and value equality but
//! none of the original text, file names, paths, images or external ids, so
//! it can be attached to a bug report.
//!
//! # Guarantees
//! - The source store is opened read-only and never modified
//! - On failure no output file is left behind
//! - Offline operation, no telemetry

use anyhow::{Context, Result};
use clap::{Args, Parser};
use dbanon_core::logging::{LogFormat, init_logging};
use dbanon_core::{Anonymiser, AnonymiserConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dbanon")]
#[command(about = "Create an anonymised, shareable copy of a media-library database")]
#[command(version)]
#[command(long_about = "
dbanon - anonymised copies of media-library databases

Copies the source database and rewrites the copy so it can be shared:
- Titles, names, details, URLs and aliases become random text of the same shape
- Codes, marker titles and fingerprints stay equal where they were equal
- Folder paths are rebuilt from folder ids, file names become file ids
- Cover images and external service ids are removed

The source database is never modified. If anything fails, no output file is
left behind.

EXAMPLES:
  dbanon stash-go.sqlite -o anonymous.sqlite
  dbanon stash-go.sqlite -o anonymous.sqlite --report > report.json
  dbanon stash-go.sqlite -o anonymous.sqlite --config dbanon.json -v
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Source database
    #[arg(help = "Path to the database to anonymise (opened read-only)")]
    source: PathBuf,

    /// Output database
    #[arg(short, long, help = "Path of the anonymised copy; must not exist")]
    output: PathBuf,

    /// Configuration file
    #[arg(long, env = "DBANON_CONFIG", help = "JSON configuration file")]
    config: Option<PathBuf>,

    /// Rows per page
    #[arg(long, help = "Rows rewritten per transaction")]
    page_size: Option<u32>,

    /// Skip final VACUUM
    #[arg(long, help = "Skip ANALYZE and VACUUM after anonymising")]
    no_compact: bool,

    /// Print run report
    #[arg(long, help = "Print a JSON run report to stdout")]
    report: bool,
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    quiet: bool,

    /// JSON log lines
    #[arg(long, help = "Write log lines to stderr as JSON (DBANON_LOG overrides levels)")]
    log_json: bool,
}

impl GlobalArgs {
    fn log_format(&self) -> LogFormat {
        if self.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format())?;

    let config = load_config(&cli)?;
    let anonymiser = Anonymiser::new(config).context("invalid configuration")?;

    let report = anonymiser
        .anonymise(&cli.source, &cli.output)
        .await
        .map_err(|e| {
            error!("Anonymisation failed: {}", e);
            e
        })
        .with_context(|| format!("failed to anonymise {}", cli.source.display()))?;

    info!(
        "✓ Wrote {} ({} rows rewritten)",
        cli.output.display(),
        report.total_rows()
    );

    if cli.report {
        let json = serde_json::to_string_pretty(&report).context("serialising run report")?;
        println!("{}", json);
    }

    Ok(())
}

/// Builds the run configuration from the optional file and CLI overrides.
fn load_config(cli: &Cli) -> Result<AnonymiserConfig> {
    let mut config = match &cli.config {
        Some(path) => AnonymiserConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AnonymiserConfig::default(),
    };

    if let Some(page_size) = cli.page_size {
        config = config.with_page_size(page_size);
    }
    if cli.no_compact {
        config = config.with_compaction(false);
    }
    Ok(config)
}
