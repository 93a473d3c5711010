//! Run entry point: snapshot, pipeline, keep or discard.

use crate::config::AnonymiserConfig;
use crate::error::Result;
use crate::obfuscate::Obfuscator;
use crate::pipeline::{Pipeline, RunReport, RunState, StageContext};
use crate::snapshot;
use std::path::Path;
use tracing::{Instrument, info, info_span, warn};

/// Produces anonymised copies of a store.
///
/// # Example
/// ```rust,no_run
/// use dbanon_core::{Anonymiser, AnonymiserConfig};
/// use std::path::Path;
///
/// # async fn example() -> dbanon_core::Result<()> {
/// let anonymiser = Anonymiser::new(AnonymiserConfig::default())?;
/// let report = anonymiser
///     .anonymise(Path::new("stash-go.sqlite"), Path::new("anonymous.sqlite"))
///     .await?;
/// println!("{} rows rewritten", report.total_rows());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Anonymiser {
    config: AnonymiserConfig,
}

impl Anonymiser {
    /// Creates an anonymiser after validating `config`.
    pub fn new(config: AnonymiserConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration of this anonymiser.
    pub fn config(&self) -> &AnonymiserConfig {
        &self.config
    }

    /// Writes an anonymised copy of `source` to `dest` using the standard
    /// pipeline.
    ///
    /// # Errors
    /// Any failure leaves no file at `dest`. `source` is never modified.
    pub async fn anonymise(&self, source: &Path, dest: &Path) -> Result<RunReport> {
        let pipeline = Pipeline::standard(&self.config);
        self.run_pipeline(source, dest, &pipeline).await
    }

    /// Writes a copy of `source` to `dest` transformed by `pipeline`.
    pub async fn run_pipeline(
        &self,
        source: &Path,
        dest: &Path,
        pipeline: &Pipeline,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(source, dest, pipeline);
        let span = info_span!("anonymise", run_id = %report.run_id);

        async move {
            info!(
                "Anonymising {} into {}",
                source.display(),
                dest.display()
            );
            // Seeded before the copy so an unavailable random source leaves no file
            let mut obfuscator = Obfuscator::from_os_rng()?;
            let store = snapshot::create_working_copy(source, dest, &self.config).await?;

            let mut ctx = StageContext {
                pool: store.pool(),
                config: &self.config,
                obfuscator: &mut obfuscator,
            };
            if let Err(e) = pipeline.run(&mut ctx, &mut report).await {
                if let Err(cleanup) = store.discard().await {
                    warn!("Failed to discard working copy: {}", cleanup);
                }
                return Err(e);
            }

            store.persist().await;
            report.finish(RunState::Succeeded);
            info!(
                rows = report.total_rows(),
                "Anonymisation of {} complete",
                source.display()
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}
