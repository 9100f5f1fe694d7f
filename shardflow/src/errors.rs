//! Error types for the shardflow orchestrator.
//!
//! Every failure the orchestrator can surface is fatal to the pipeline; the
//! variants differ in *when* they are raised and in what they report.

use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type ShardflowResult<T> = Result<T, ShardflowError>;

/// Process exit code for success.
pub const EXIT_OK: i32 = 0;
/// Process exit code for a fatal unexpected error.
pub const EXIT_FATAL: i32 = 1;
/// Process exit code for an invalid invocation.
pub const EXIT_INVALID_INVOCATION: i32 = 2;

/// The main error type for shardflow operations.
#[derive(Debug, Error)]
pub enum ShardflowError {
    /// A required setting is missing or invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A manifest with no items was handed to the sharder.
    #[error("{0}")]
    EmptyManifest(#[from] EmptyManifestError),

    /// The backend refused the job array before anything ran.
    #[error("{0}")]
    BackendSubmission(#[from] BackendSubmissionError),

    /// One or more shard jobs ran and exited non-zero.
    #[error("{0}")]
    ShardJobFailure(#[from] ShardJobFailure),

    /// A shard reported success but left no usable output.
    #[error("{0}")]
    AggregationMismatch(#[from] AggregationMismatchError),

    /// A pipeline stage failed; wraps the underlying cause.
    #[error("Stage {stage_id} ({stage_name}) failed: {cause}")]
    StageFailed {
        /// Numeric id of the failing stage.
        stage_id: u32,
        /// Name of the failing stage.
        stage_name: String,
        /// What went wrong inside the stage.
        cause: Box<ShardflowError>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShardflowError {
    /// Wraps an error as the failure of a stage.
    #[must_use]
    pub fn stage_failed(stage_id: u32, stage_name: impl Into<String>, cause: Self) -> Self {
        Self::StageFailed {
            stage_id,
            stage_name: stage_name.into(),
            cause: Box::new(cause),
        }
    }

    /// Returns the innermost error, looking through stage wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::StageFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns true if this error means the invocation itself was invalid.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self.root_cause(), Self::Configuration(_))
    }

    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.root_cause() {
            Self::Configuration(_) => "CONFIGURATION",
            Self::EmptyManifest(_) => "EMPTY_MANIFEST",
            Self::BackendSubmission(_) => "BACKEND_SUBMISSION",
            Self::ShardJobFailure(_) => "SHARD_JOB_FAILURE",
            Self::AggregationMismatch(_) => "AGGREGATION_MISMATCH",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO",
            Self::StageFailed { .. } => "STAGE_FAILED",
        }
    }

    /// Maps the error to the process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_configuration() {
            EXIT_INVALID_INVOCATION
        } else {
            EXIT_FATAL
        }
    }

    /// Converts to a dictionary representation for reports.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), json!(self.code()));
        map.insert("message".to_string(), json!(self.to_string()));
        map.insert("exit_code".to_string(), json!(self.exit_code()));

        if let Self::StageFailed {
            stage_id,
            stage_name,
            ..
        } = self
        {
            map.insert("stage_id".to_string(), json!(stage_id));
            map.insert("stage".to_string(), json!(stage_name));
        }

        if let Self::ShardJobFailure(failure) = self.root_cause() {
            map.insert(
                "failed_shards".to_string(),
                json!(failure.failed_indices()),
            );
        }

        map
    }
}

/// Error raised when a required setting is missing or invalid.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The offending configuration key, when known.
    pub key: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    /// Sets the offending key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Error raised when there is nothing to shard.
#[derive(Debug, Clone, Error)]
#[error("Manifest '{manifest}' has no items to shard")]
pub struct EmptyManifestError {
    /// Name of the empty manifest.
    pub manifest: String,
}

impl EmptyManifestError {
    /// Creates a new empty manifest error.
    #[must_use]
    pub fn new(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }
}

/// Error raised when a backend rejects a job array before execution.
#[derive(Debug, Clone, Error)]
#[error("Backend '{backend}' rejected job array '{task}': {message}")]
pub struct BackendSubmissionError {
    /// The backend name.
    pub backend: String,
    /// The task whose jobs were being submitted.
    pub task: String,
    /// What the backend reported.
    pub message: String,
}

impl BackendSubmissionError {
    /// Creates a new submission error.
    #[must_use]
    pub fn new(
        backend: impl Into<String>,
        task: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            task: task.into(),
            message: message.into(),
        }
    }
}

/// One failed shard inside a [`ShardJobFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedShard {
    /// 1-based shard index.
    pub index: usize,
    /// Exit code, if the job got far enough to have one.
    pub exit_code: Option<i32>,
    /// Where the job's output was logged.
    pub log_path: Option<PathBuf>,
    /// Human-readable reason.
    pub reason: String,
}

impl std::fmt::Display for FailedShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {}", self.index)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit {code})")?;
        }
        if let Some(ref log) = self.log_path {
            write!(f, " see {}", log.display())?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

/// Error raised after the barrier when one or more shards failed.
///
/// All failing shards are listed, not only the first one observed.
#[derive(Debug, Clone, Error)]
#[error("{} of {total_jobs} shard jobs failed for '{task}': {}", .failures.len(), render_failures(.failures))]
pub struct ShardJobFailure {
    /// The task whose shards failed.
    pub task: String,
    /// Number of jobs submitted.
    pub total_jobs: usize,
    /// Every failing shard, ordered by index.
    pub failures: Vec<FailedShard>,
}

impl ShardJobFailure {
    /// Creates a new shard failure report. Failures are ordered by index.
    #[must_use]
    pub fn new(task: impl Into<String>, total_jobs: usize, mut failures: Vec<FailedShard>) -> Self {
        failures.sort_by_key(|f| f.index);
        Self {
            task: task.into(),
            total_jobs,
            failures,
        }
    }

    /// Returns the failing shard indices.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

fn render_failures(failures: &[FailedShard]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error raised when shard outputs cannot be merged.
#[derive(Debug, Clone, Error)]
#[error("Aggregation mismatch{}: {message}", .shard.map(|s| format!(" in shard {s}")).unwrap_or_default())]
pub struct AggregationMismatchError {
    /// The offending shard, when the mismatch is attributable.
    pub shard: Option<usize>,
    /// The path that was expected or malformed.
    pub path: Option<PathBuf>,
    /// Description of the mismatch.
    pub message: String,
}

impl AggregationMismatchError {
    /// Creates a new aggregation mismatch error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            shard: None,
            path: None,
            message: message.into(),
        }
    }

    /// Attributes the mismatch to a shard.
    #[must_use]
    pub fn for_shard(mut self, shard: usize) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Records the path involved.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Error for a shard that reported success but wrote nothing.
    #[must_use]
    pub fn missing_output(shard: usize, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(format!("expected output at {} was not produced", path.display()))
            .for_shard(shard)
            .with_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_exit_code() {
        let err: ShardflowError = ConfigurationError::new("nj must be positive")
            .with_key("nj")
            .into();

        assert_eq!(err.exit_code(), EXIT_INVALID_INVOCATION);
        assert_eq!(err.code(), "CONFIGURATION");
        assert!(err.to_string().contains("nj must be positive"));
    }

    #[test]
    fn test_stage_failed_keeps_root_cause() {
        let inner: ShardflowError = ConfigurationError::new("unknown option 'foo'").into();
        let err = ShardflowError::stage_failed(3, "decode", inner);

        assert!(err.is_configuration());
        assert_eq!(err.exit_code(), EXIT_INVALID_INVOCATION);
        assert!(err.to_string().starts_with("Stage 3 (decode) failed"));

        let dict = err.to_dict();
        assert_eq!(dict.get("stage_id").unwrap(), &json!(3));
        assert_eq!(dict.get("code").unwrap(), "CONFIGURATION");
    }

    #[test]
    fn test_shard_failure_lists_every_shard() {
        let failure = ShardJobFailure::new(
            "extract",
            4,
            vec![
                FailedShard {
                    index: 3,
                    exit_code: Some(2),
                    log_path: None,
                    reason: String::new(),
                },
                FailedShard {
                    index: 1,
                    exit_code: Some(1),
                    log_path: Some(PathBuf::from("log/extract.1.log")),
                    reason: String::new(),
                },
            ],
        );

        assert_eq!(failure.failed_indices(), vec![1, 3]);
        let message = failure.to_string();
        assert!(message.starts_with("2 of 4 shard jobs failed for 'extract'"));
        assert!(message.contains("shard 1 (exit 1) see log/extract.1.log"));
        assert!(message.contains("shard 3 (exit 2)"));

        let err: ShardflowError = failure.into();
        assert_eq!(err.exit_code(), EXIT_FATAL);
        assert_eq!(err.to_dict().get("failed_shards").unwrap(), &json!([1, 3]));
    }

    #[test]
    fn test_aggregation_mismatch_message() {
        let err = AggregationMismatchError::missing_output(2, "exp/output.2/text");
        assert_eq!(err.shard, Some(2));
        assert!(err.to_string().starts_with("Aggregation mismatch in shard 2"));

        let unattributed = AggregationMismatchError::new("no inputs");
        assert_eq!(unattributed.to_string(), "Aggregation mismatch: no inputs");
    }
}
