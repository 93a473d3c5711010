//! Ordered anonymisation stages and their run bookkeeping.
//!
//! A [`Pipeline`] runs its stages strictly one after another on the working
//! store. The first failing stage aborts the run; later stages are never
//! started and the caller discards the store.

mod stages;

pub use stages::{Compact, DeleteExternalIds, EntityStage, Files, Folders, StripBlobs};

use crate::config::AnonymiserConfig;
use crate::error::Result;
use crate::obfuscate::Obfuscator;
use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Everything a stage may use while it runs.
#[derive(Debug)]
pub struct StageContext<'a> {
    /// Working store
    pub pool: &'a SqlitePool,
    /// Run configuration
    pub config: &'a AnonymiserConfig,
    /// Replacement generator shared by all stages of the run
    pub obfuscator: &'a mut Obfuscator,
}

/// One named unit of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs, reports and errors.
    fn name(&self) -> &str;

    /// Runs the stage and returns how many rows it processed.
    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64>;
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not started
    Pending,
    /// Currently running
    Running,
    /// Finished without error
    Succeeded,
    /// Returned an error and aborted the run
    Failed,
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Stages still running
    Running,
    /// Every stage succeeded and the store was kept
    Succeeded,
    /// A stage failed and the store was discarded
    Aborted,
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name
    pub name: String,
    /// Final state
    pub state: StageState,
    /// Rows processed
    pub rows: u64,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

/// Summary of an anonymisation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of this run, also attached to its log span
    pub run_id: Uuid,
    /// Source store
    pub source: PathBuf,
    /// Anonymised store
    pub output: PathBuf,
    /// Start of the run
    pub started_at: DateTime<Utc>,
    /// End of the run
    pub finished_at: Option<DateTime<Utc>>,
    /// Run state
    pub state: RunState,
    /// Per-stage outcomes in run order
    pub stages: Vec<StageRecord>,
}

impl RunReport {
    /// Creates a report with every stage of `pipeline` pending.
    pub fn new(source: &Path, output: &Path, pipeline: &Pipeline) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Running,
            stages: pipeline
                .stage_names()
                .map(|name| StageRecord {
                    name: name.to_string(),
                    state: StageState::Pending,
                    rows: 0,
                    elapsed_ms: 0,
                })
                .collect(),
        }
    }

    /// Marks the run finished in `state`.
    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Total rows processed by all stages.
    pub fn total_rows(&self) -> u64 {
        self.stages.iter().map(|s| s.rows).sum()
    }

    /// Record of the named stage.
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// An ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

impl Pipeline {
    /// Creates a pipeline from explicit stages.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// The full anonymisation of a media-library store, leaves first.
    ///
    /// Compaction is appended only when `config.compact` is set.
    pub fn standard(config: &AnonymiserConfig) -> Self {
        let mut pipeline = Self::new(vec![
            Box::new(StripBlobs),
            Box::new(DeleteExternalIds),
            Box::new(Folders::new(schema::FOLDERS)),
            Box::new(Files::new(schema::FILES)),
        ]);
        for entity in schema::ENTITIES {
            pipeline.push(EntityStage::new(*entity));
        }
        if config.compact {
            pipeline.push(Compact);
        }
        pipeline
    }

    /// Appends a stage.
    pub fn push(&mut self, stage: impl Stage + 'static) {
        self.stages.push(Box::new(stage));
    }

    /// Stage names in run order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.stages.iter().map(|s| s.name())
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order, recording progress in `report`.
    ///
    /// # Errors
    /// Returns the first stage error wrapped in
    /// [`crate::AnonymiseError::StageFailed`]. The report is left `Aborted`
    /// with the failing stage `Failed` and all later stages `Pending`.
    pub async fn run(&self, ctx: &mut StageContext<'_>, report: &mut RunReport) -> Result<()> {
        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            info!("Anonymising {}", name);
            set_state(report, index, StageState::Running);
            let started = Instant::now();

            let outcome = stage.run(ctx).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(rows) => {
                    if let Some(record) = report.stages.get_mut(index) {
                        record.state = StageState::Succeeded;
                        record.rows = rows;
                        record.elapsed_ms = elapsed_ms;
                    }
                    info!(rows, elapsed_ms, "Finished anonymising {}", name);
                }
                Err(e) => {
                    if let Some(record) = report.stages.get_mut(index) {
                        record.state = StageState::Failed;
                        record.elapsed_ms = elapsed_ms;
                    }
                    report.finish(RunState::Aborted);
                    error!("Stage {} failed: {}", name, e);
                    return Err(e.in_stage(name));
                }
            }
        }
        Ok(())
    }
}

fn set_state(report: &mut RunReport, index: usize, state: StageState) {
    if let Some(record) = report.stages.get_mut(index) {
        record.state = state;
    }
}
