//! Run identity, status, and the run record persisted after each stage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NewsfeedError, Result};
use crate::types::StageName;

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// `NotStarted → Running(stage) → Completed | Failed(stage)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running { stage: StageName },
    Completed,
    Failed { stage: StageName, reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Running { stage } => write!(f, "running {stage}"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { stage, reason } => write!(f, "failed at stage {stage}: {reason}"),
        }
    }
}

/// A per-item or per-entity problem recorded against the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: StageName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub kind: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(stage: StageName, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            source_ref: None,
            entity: None,
            kind: kind.into(),
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn from_error(stage: StageName, err: &NewsfeedError) -> Self {
        Self::new(stage, err.kind(), err.to_string())
    }

    pub fn for_source(mut self, source_ref: impl Into<String>, entity: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self.entity = Some(entity.into());
        self
    }

    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

/// Item counts a stage reports when it commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub input: usize,
    pub output: usize,
    /// Items lost to service or validation failures.
    pub dropped: usize,
    /// Items removed by a projection (e.g. score below threshold).
    pub filtered: usize,
}

/// The run record (`run.json`). Only ever moves forward: committed stages
/// and their artifacts are never rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Ordered set: each stage appears at most once, in commit order.
    pub stages_completed: Vec<StageName>,
    pub artifacts: BTreeMap<StageName, PathBuf>,
    #[serde(default)]
    pub stats: BTreeMap<StageName, StageStats>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl PipelineRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            started_at: now,
            updated_at: now,
            status: RunStatus::NotStarted,
            stages_completed: Vec::new(),
            artifacts: BTreeMap::new(),
            stats: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn has_completed(&self, stage: StageName) -> bool {
        self.stages_completed.contains(&stage)
    }

    /// Enter `Running(stage)`. A stage may run at most once per run.
    pub fn begin(&mut self, stage: StageName) -> Result<()> {
        if self.status.is_terminal() {
            return Err(NewsfeedError::validation(format!(
                "run {} is already {}",
                self.run_id, self.status
            )));
        }
        if self.has_completed(stage) {
            return Err(NewsfeedError::validation(format!(
                "stage {stage} already completed in run {}",
                self.run_id
            )));
        }
        self.status = RunStatus::Running { stage };
        self.touch();
        Ok(())
    }

    /// Record a committed artifact for `stage`.
    pub fn commit(&mut self, stage: StageName, artifact: PathBuf, stats: StageStats) {
        if !self.has_completed(stage) {
            self.stages_completed.push(stage);
        }
        self.artifacts.insert(stage, artifact);
        self.stats.insert(stage, stats);
        self.touch();
    }

    pub fn fail(&mut self, stage: StageName, reason: impl Into<String>) {
        self.status = RunStatus::Failed {
            stage,
            reason: reason.into(),
        };
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.touch();
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn record_all(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}
