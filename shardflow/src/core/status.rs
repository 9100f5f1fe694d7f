//! Job and pipeline run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of one backend job.
///
/// A job transitions `Pending -> Running -> {Succeeded | Failed}` exactly once.
/// A job that never starts goes straight from `Pending` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted but not yet started.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Exited zero.
    Succeeded,
    /// Exited non-zero, could not be started, or never reported.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the job succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if a job may move from this status to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed => false,
        }
    }

    /// Status for a finished process with the given exit code.
    #[must_use]
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

/// The state of a [`StageRunner`](crate::pipeline::StageRunner).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    /// No stage has been started.
    #[default]
    NotStarted,
    /// The given stage is executing.
    Running {
        /// Id of the running stage.
        stage_id: u32,
    },
    /// Every in-range stage finished.
    Succeeded,
    /// A stage failed; nothing after it ran.
    Failed {
        /// Id of the failing stage.
        stage_id: u32,
        /// Rendered cause.
        cause: String,
    },
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running { stage_id } => write!(f, "running({stage_id})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { stage_id, cause } => write!(f, "failed({stage_id}): {cause}"),
        }
    }
}

impl RunState {
    /// Returns true once the runner can make no further progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}
