//! Execution backends.
//!
//! A backend receives an array of indexed jobs built from one
//! [`CommandSpec`] and reports one terminal [`JobResult`] per index. Three
//! backends are provided:
//!
//! - [`LocalBackend`]: child processes on this host
//! - [`QueueBackend`] in grid-engine mode (`qsub`)
//! - [`QueueBackend`] in Slurm mode (`sbatch`)

mod command;
mod local;
mod options;
mod queue;
mod resources;

pub use command::{shell_quote, CommandSpec, RenderedCommand, DEFAULT_PLACEHOLDER};
pub use local::LocalBackend;
pub use options::OptionTable;
pub use queue::QueueBackend;
pub use resources::ResourceRequest;

use crate::config::RunConfig;
use crate::core::JobStatus;
use crate::errors::{ConfigurationError, FailedShard, ShardflowResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Which kind of backend executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Local process pool.
    #[default]
    Local,
    /// Grid-engine scheduler (`qsub`).
    GridEngine,
    /// Slurm scheduler (`sbatch`).
    Slurm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::GridEngine => write!(f, "grid-engine"),
            Self::Slurm => write!(f, "slurm"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "run" => Ok(Self::Local),
            "grid-engine" | "gridengine" | "sge" | "queue" => Ok(Self::GridEngine),
            "slurm" => Ok(Self::Slurm),
            other => Err(ConfigurationError::new(format!(
                "unknown backend '{other}' (expected local, grid-engine or slurm)"
            ))
            .with_key("backend")),
        }
    }
}

impl BackendKind {
    /// Built-in option table for this backend.
    #[must_use]
    pub fn default_table(&self) -> OptionTable {
        match self {
            Self::Local => OptionTable::local(),
            Self::GridEngine => OptionTable::grid_engine(),
            Self::Slurm => OptionTable::slurm(),
        }
    }
}

/// An array of jobs sharing one command template.
#[derive(Debug, Clone)]
pub struct JobBatch {
    /// Name of the batch; used for log and script file names.
    pub name: String,
    /// Command template; the placeholder is replaced by each job index.
    pub command: CommandSpec,
    /// Number of jobs, indexed `1..=job_count`.
    pub job_count: usize,
    /// Directory receiving per-job logs.
    pub log_dir: PathBuf,
}

impl JobBatch {
    /// Creates a batch.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        job_count: usize,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            job_count,
            log_dir: log_dir.into(),
        }
    }

    /// Log file of the job with the given index.
    #[must_use]
    pub fn log_path(&self, index: usize) -> PathBuf {
        self.log_dir.join(format!("{}.{index}.log", self.name))
    }

    /// Iterates over the job indices.
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        1..=self.job_count
    }
}

/// The status and outcome of one job.
///
/// Backends create a result as [`pending`](Self::pending) at dispatch and
/// move it through [`start`](Self::start) to [`finish`](Self::finish) or
/// [`fail`](Self::fail). Out-of-order transitions are ignored, so a result
/// reaches a terminal status at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// 1-based job index.
    pub index: usize,
    /// Current status; terminal once returned from a backend.
    pub status: JobStatus,
    /// Exit code, when the job ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Where the job's output was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// When the job started (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the job was observed finished (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Extra detail for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobResult {
    /// A job that has been dispatched but not started.
    #[must_use]
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: JobStatus::Pending,
            exit_code: None,
            log_path: None,
            started_at: None,
            finished_at: None,
            message: None,
        }
    }

    /// A job that ran and exited with `exit_code`.
    #[must_use]
    pub fn exited(index: usize, exit_code: i32) -> Self {
        Self::pending(index).start().finish(exit_code)
    }

    /// A job that failed without an exit code.
    #[must_use]
    pub fn failed(index: usize, message: impl Into<String>) -> Self {
        Self::pending(index).fail(message)
    }

    /// Marks the job running and records the start time.
    #[must_use]
    pub fn start(mut self) -> Self {
        if self.advance(JobStatus::Running) {
            self.started_at = Some(crate::core::iso_timestamp());
        }
        self
    }

    /// Records the exit code of a running job.
    #[must_use]
    pub fn finish(mut self, exit_code: i32) -> Self {
        if self.advance(JobStatus::from_exit_code(exit_code)) {
            self.exit_code = Some(exit_code);
            self.finished_at = Some(crate::core::iso_timestamp());
        }
        self
    }

    /// Fails a job that has not reached a terminal status.
    #[must_use]
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        if self.advance(JobStatus::Failed) {
            self.message = Some(message.into());
            self.finished_at = Some(crate::core::iso_timestamp());
        }
        self
    }

    fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(job = self.index, from = %self.status, to = %next, "Ignoring job status transition");
            return false;
        }
        self.status = next;
        true
    }

    /// Sets the log path.
    #[must_use]
    pub fn with_log(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    /// Sets the failure detail.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_started_at(mut self, started_at: impl Into<String>) -> Self {
        self.started_at = Some(started_at.into());
        self
    }

    /// Returns true if the job succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Describes this job as a failed shard.
    #[must_use]
    pub fn to_failed_shard(&self) -> FailedShard {
        FailedShard {
            index: self.index,
            exit_code: self.exit_code,
            log_path: self.log_path.clone(),
            reason: self.message.clone().unwrap_or_default(),
        }
    }
}

/// An execution backend for job arrays.
///
/// `submit` returns once every job is terminal. A job that ran and failed is
/// reported in its [`JobResult`]; an `Err` means the batch was rejected
/// before execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Checks a resource request against the backend's option table without
    /// submitting anything.
    ///
    /// # Errors
    ///
    /// A [`ConfigurationError`](crate::errors::ConfigurationError) for a key
    /// or value the backend cannot express.
    fn validate_resources(&self, resources: &ResourceRequest) -> ShardflowResult<()>;

    /// Runs every job of the batch and waits for all of them.
    async fn submit(
        &self,
        batch: &JobBatch,
        resources: &ResourceRequest,
    ) -> ShardflowResult<Vec<JobResult>>;
}

/// Builds the backend selected by the configuration.
pub fn create_backend(config: &RunConfig) -> ShardflowResult<Arc<dyn BackendAdapter>> {
    let table = match &config.queue_conf {
        Some(path) => OptionTable::load(path)?,
        None => config.backend.default_table(),
    };

    match config.backend {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new().with_table(table))),
        kind => {
            let mut backend = QueueBackend::new(kind, table)
                .with_poll_interval(Duration::from_millis(config.poll_interval_ms));
            if let Some(secs) = config.job_timeout_secs {
                backend = backend.with_timeout(Duration::from_secs(secs));
            }
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("SGE".parse::<BackendKind>().unwrap(), BackendKind::GridEngine);
        assert_eq!("slurm".parse::<BackendKind>().unwrap(), BackendKind::Slurm);

        let err = "pbs".parse::<BackendKind>().unwrap_err();
        assert_eq!(err.key.as_deref(), Some("backend"));
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::GridEngine).unwrap();
        assert_eq!(json, "\"grid-engine\"");
        assert_eq!(BackendKind::GridEngine.to_string(), "grid-engine");
    }

    #[test]
    fn test_batch_log_path() {
        let batch = JobBatch::new("decode", CommandSpec::new("true"), 3, "exp/log");
        assert_eq!(batch.log_path(2), PathBuf::from("exp/log/decode.2.log"));
        assert_eq!(batch.indices().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_job_result_lifecycle() {
        let job = JobResult::pending(4);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        let job = job.start();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        let job = job.finish(0);
        assert!(job.is_success());
        assert_eq!(job.exit_code, Some(0));

        let again = job.clone().fail("late failure").finish(1);
        assert_eq!(again, job);

        let never_started = JobResult::pending(5).finish(0);
        assert_eq!(never_started.status, JobStatus::Pending);
        assert_eq!(JobResult::failed(5, "no slot").started_at, None);
    }

    #[test]
    fn test_job_result_to_failed_shard() {
        let result = JobResult::exited(2, 3).with_log("log/x.2.log");
        assert_eq!(result.status, JobStatus::Failed);

        let failed = result.to_failed_shard();
        assert_eq!(failed.index, 2);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.to_string(), "shard 2 (exit 3) see log/x.2.log");
    }

    #[test]
    fn test_create_backend() {
        let local = create_backend(&RunConfig::default()).unwrap();
        assert_eq!(local.kind(), BackendKind::Local);

        let slurm = create_backend(&RunConfig::default().with_backend(BackendKind::Slurm)).unwrap();
        assert_eq!(slurm.kind(), BackendKind::Slurm);

        let missing = RunConfig::default().with_queue_conf("/nonexistent/queue.conf");
        assert!(create_backend(&missing).is_err());
    }
}
