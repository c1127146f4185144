//! Outcome types for stages and whole pipeline runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{deserialize_duration, serialize_duration};

/// Terminal (or in-flight) status of a single stage.
///
/// `Unstable` is distinct from `Failure`: it means the stage's steps all
/// completed, but a post-hook or a non-fatal check downgraded the result
/// without aborting the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Queued, not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// All steps completed without error.
    Success,
    /// A step failed and the stage was aborted.
    Failure,
    /// The stage was cancelled before completing.
    Aborted,
    /// Completed, but degraded (e.g. a non-fatal post-hook failed).
    Unstable,
}

impl StageStatus {
    /// Whether this status represents a stage that is done executing
    /// (as opposed to `Pending` or `Running`).
    pub fn is_terminal(self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

/// The recorded outcome of a single stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage's declared name.
    pub name: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Wall-clock time spent running the stage's steps and post-hooks.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    /// Human-readable failure summary, populated when `status` is
    /// `Failure`, `Aborted`, or `Unstable`.
    pub error_message: Option<String>,
}

impl StageResult {
    /// Build a successful result.
    pub fn success(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Success,
            duration,
            error_message: None,
        }
    }

    /// Build a failed result carrying an explanatory message.
    pub fn failure(name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Failure,
            duration,
            error_message: Some(message.into()),
        }
    }
}

/// Overall status of a pipeline run, derived from its stage results.
///
/// A pipeline is `Unstable` if every stage succeeded or was merely unstable
/// but at least one stage was `Unstable`; it is `Failure` if any stage
/// failed or was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every stage succeeded.
    Success,
    /// Every stage succeeded or was unstable, and at least one was unstable.
    Unstable,
    /// At least one stage failed or was aborted.
    Failure,
    /// The run was cancelled before all stages completed.
    Aborted,
}

impl PipelineStatus {
    /// Derive the aggregate status from an ordered list of stage results,
    /// short-circuiting to `Aborted`/`Failure` as soon as one is found.
    pub fn aggregate(stages: &[StageResult]) -> Self {
        let mut unstable = false;
        for stage in stages {
            match stage.status {
                StageStatus::Aborted => return PipelineStatus::Aborted,
                StageStatus::Failure => return PipelineStatus::Failure,
                StageStatus::Unstable => unstable = true,
                StageStatus::Success => {}
                StageStatus::Pending | StageStatus::Running => {}
            }
        }
        if unstable {
            PipelineStatus::Unstable
        } else {
            PipelineStatus::Success
        }
    }
}

/// The final record of a whole pipeline run: its stages, in declaration
/// order, and the aggregate status derived from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Aggregate status across all stages.
    pub status: PipelineStatus,
    /// Per-stage results, in the order the stages were declared.
    pub stages: Vec<StageResult>,
    /// Total wall-clock duration of the run.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
}

impl PipelineResult {
    /// Build a result from a completed (or aborted) list of stages,
    /// deriving `status` via [`PipelineStatus::aggregate`].
    pub fn from_stages(stages: Vec<StageResult>, duration: Duration) -> Self {
        let status = PipelineStatus::aggregate(&stages);
        Self {
            status,
            stages,
            duration,
        }
    }
}
