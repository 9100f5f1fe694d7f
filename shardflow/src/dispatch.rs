//! Fan-out of one stage task into shard jobs, and the barrier that joins them.
//!
//! For a task with a manifest of `n` items and parallelism `p`, the
//! dispatcher lays out:
//!
//! ```text
//! <work_dir>/split<S>/keys.<i>.scp   shard key files
//! <work_dir>/output.<i>/             private per-shard output
//! <work_dir>/log/<task>.<i>.log      per-job logs
//! ```
//!
//! with `S = min(n, p)` (or fewer, see [`SplitStrategy`]). The command
//! template may use `{keys}` and `{outdir}`, which are expanded to the paths
//! above with the index placeholder still in place, so each job sees its own
//! files.

use crate::backend::{BackendAdapter, CommandSpec, JobBatch, JobResult, ResourceRequest};
use crate::errors::{ConfigurationError, FailedShard, ShardJobFailure, ShardflowResult};
use crate::events::{EventSink, NoOpEventSink};
use crate::manifest::{split_with, SplitStrategy, WorkManifest};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// One stage task: a command to run once, or once per shard of a manifest.
#[derive(Debug, Clone)]
pub struct StageTask {
    /// Task name, used for logs and job names.
    pub name: String,
    /// Items to shard. `None` runs a single job.
    pub manifest: Option<Arc<WorkManifest>>,
    /// Command template.
    pub command: CommandSpec,
    /// Maximum number of shards.
    pub parallelism: usize,
    /// Resources requested per job.
    pub resources: ResourceRequest,
    /// Root of this task's key files, outputs and logs.
    pub work_dir: PathBuf,
}

impl StageTask {
    /// Creates a single-job task.
    #[must_use]
    pub fn new(name: impl Into<String>, command: CommandSpec, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            manifest: None,
            command,
            parallelism: 1,
            resources: ResourceRequest::default(),
            work_dir: work_dir.into(),
        }
    }

    /// Shards the task over a manifest.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Arc<WorkManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Sets the maximum number of shards.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the per-job resources.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Directory receiving the per-job logs.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("log")
    }
}

/// The private output location of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOutput {
    /// 1-based shard index.
    pub index: usize,
    /// The shard's output directory.
    pub output_dir: PathBuf,
    /// The shard's key file, when the task had a manifest.
    pub key_file: Option<PathBuf>,
}

/// Everything the aggregator needs after a successful barrier.
#[derive(Debug, Clone)]
pub struct AggregationInput {
    /// Task the shards belong to.
    pub task: String,
    /// Per-shard outputs, ordered by index.
    pub shard_outputs: Vec<ShardOutput>,
    /// Terminal results, ordered by index.
    pub results: Vec<JobResult>,
    /// The manifest the task was sharded over.
    pub manifest: Option<Arc<WorkManifest>>,
}

impl AggregationInput {
    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shard_outputs.len()
    }

    /// Returns true if there are no shards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shard_outputs.is_empty()
    }

    /// Per-shard output directories, ordered by index.
    pub fn output_dirs(&self) -> impl Iterator<Item = &Path> {
        self.shard_outputs.iter().map(|s| s.output_dir.as_path())
    }
}

/// Runs stage tasks as parallel shard jobs on a backend.
#[derive(Clone)]
pub struct JobDispatcher {
    backend: Arc<dyn BackendAdapter>,
    events: Arc<dyn EventSink>,
    strategy: SplitStrategy,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("backend", &self.backend.kind())
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    /// Creates a dispatcher over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn BackendAdapter>) -> Self {
        Self {
            backend,
            events: Arc::new(NoOpEventSink),
            strategy: SplitStrategy::default(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the split strategy.
    #[must_use]
    pub fn with_split_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn BackendAdapter> {
        &self.backend
    }

    /// Runs a task and blocks until every job is terminal.
    ///
    /// Succeeds only if every shard succeeded. Otherwise returns a
    /// [`ShardJobFailure`] listing every failed shard; partial outputs are
    /// left on disk.
    pub async fn run_stage_task(&self, task: &StageTask) -> ShardflowResult<AggregationInput> {
        if task.parallelism == 0 {
            return Err(ConfigurationError::new(format!(
                "parallelism for task '{}' must be at least 1",
                task.name
            ))
            .with_key("parallelism")
            .into());
        }

        let placeholder = task.command.placeholder().to_string();
        let mut command = task.command.clone();
        let mut key_files = Vec::new();

        let job_count = match &task.manifest {
            Some(manifest) => {
                let shards = split_with(manifest, task.parallelism, self.strategy)?;
                let split_dir = task.work_dir.join(format!("split{}", shards.len()));
                for shard in &shards {
                    key_files.push(Some(shard.write_key_file(&split_dir)?));
                }
                let keys = split_dir.join(format!("keys.{placeholder}.scp"));
                command = command.expand_var("keys", &keys.display().to_string());
                shards.len()
            }
            None => {
                key_files.push(None);
                1
            }
        };

        let mut shard_outputs = Vec::with_capacity(job_count);
        for (i, key_file) in key_files.into_iter().enumerate() {
            let index = i + 1;
            let output_dir = task.work_dir.join(format!("output.{index}"));
            if output_dir.exists() {
                debug!(task = %task.name, shard = index, "Clearing previous shard output");
                std::fs::remove_dir_all(&output_dir)?;
            }
            std::fs::create_dir_all(&output_dir)?;
            shard_outputs.push(ShardOutput {
                index,
                output_dir,
                key_file,
            });
        }
        let outdir = task.work_dir.join(format!("output.{placeholder}"));
        command = command.expand_var("outdir", &outdir.display().to_string());

        let batch = JobBatch::new(&task.name, command, job_count, task.log_dir());
        info!(
            task = %task.name,
            backend = %self.backend.kind(),
            jobs = job_count,
            "Dispatching shard jobs"
        );
        self.events.try_emit(
            "shard.submitted",
            Some(json!({"task": task.name, "jobs": job_count})),
        );

        let reported = self.backend.submit(&batch, &task.resources).await?;
        let (results, failures) = self.collect(task, &batch, reported);

        self.events.try_emit(
            "shard.barrier",
            Some(json!({
                "task": task.name,
                "succeeded": job_count - failures.len(),
                "failed": failures.len(),
            })),
        );

        if !failures.is_empty() {
            return Err(ShardJobFailure::new(&task.name, job_count, failures).into());
        }

        Ok(AggregationInput {
            task: task.name.clone(),
            shard_outputs,
            results,
            manifest: task.manifest.clone(),
        })
    }

    fn collect(
        &self,
        task: &StageTask,
        batch: &JobBatch,
        mut reported: Vec<JobResult>,
    ) -> (Vec<JobResult>, Vec<FailedShard>) {
        reported.sort_by_key(|r| r.index);
        let mut results = Vec::with_capacity(batch.job_count);
        let mut failures = Vec::new();

        for index in batch.indices() {
            let result = reported
                .iter()
                .find(|r| r.index == index)
                .cloned()
                .unwrap_or_else(|| {
                    JobResult::failed(index, "backend reported no result").with_log(batch.log_path(index))
                });
            let result = if result.status.is_terminal() {
                result
            } else {
                let status = result.status;
                result.fail(format!("backend returned the job while {status}"))
            };

            if result.is_success() {
                self.events.try_emit(
                    "shard.completed",
                    Some(json!({"task": task.name, "shard": index, "exit_code": result.exit_code})),
                );
            } else {
                error!(
                    task = %task.name,
                    shard = index,
                    exit_code = ?result.exit_code,
                    log = ?result.log_path,
                    "Shard job failed"
                );
                self.events.try_emit(
                    "shard.failed",
                    Some(json!({
                        "task": task.name,
                        "shard": index,
                        "exit_code": result.exit_code,
                        "log": result.log_path,
                    })),
                );
                failures.push(result.to_failed_shard());
            }
            results.push(result);
        }

        (results, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, MockBackendAdapter};
    use crate::errors::{BackendSubmissionError, ShardflowError};
    use crate::events::CollectingEventSink;
    use crate::testing::MockBackend;

    fn manifest(n: usize) -> Arc<WorkManifest> {
        Arc::new(WorkManifest::from_ids("wav.scp", (1..=n).map(|i| format!("u{i}"))).unwrap())
    }

    #[tokio::test]
    async fn test_single_job_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let dispatcher = JobDispatcher::new(backend.clone());

        let task = StageTask::new("vocab", CommandSpec::new("build-vocab"), dir.path());
        let input = dispatcher.run_stage_task(&task).await.unwrap();

        assert_eq!(input.len(), 1);
        assert_eq!(input.shard_outputs[0].key_file, None);
        assert_eq!(backend.total_jobs(), 1);
    }

    #[tokio::test]
    async fn test_shards_capped_by_items() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let dispatcher = JobDispatcher::new(backend.clone());

        let task = StageTask::new("feats", CommandSpec::new("extract").args(["{keys}", "{outdir}"]), dir.path())
            .with_manifest(manifest(5))
            .with_parallelism(32);
        let input = dispatcher.run_stage_task(&task).await.unwrap();

        assert_eq!(input.len(), 5);
        assert_eq!(backend.total_jobs(), 5);
        assert!(dir.path().join("split5/keys.5.scp").exists());

        let commands = backend.rendered_commands();
        let third = &commands[2];
        assert!(third.args[0].ends_with("split5/keys.3.scp"));
        assert!(third.args[1].ends_with("output.3"));
    }

    #[tokio::test]
    async fn test_rerun_starts_from_empty_shard_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let task = |backend: MockBackend| {
            let dispatcher = JobDispatcher::new(Arc::new(backend));
            let task = StageTask::new("decode", CommandSpec::new("decode").arg("{outdir}"), dir.path())
                .with_manifest(manifest(2))
                .with_parallelism(2);
            async move { dispatcher.run_stage_task(&task).await }
        };

        let writes = MockBackend::new().with_job(|cmd| {
            std::fs::write(Path::new(&cmd.args[0]).join("text"), format!("u{} old\n", cmd.index))
        });
        let first = task(writes).await.unwrap();
        assert!(first.shard_outputs[1].output_dir.join("text").is_file());

        let rerun = task(MockBackend::new()).await.unwrap();
        for shard in &rerun.shard_outputs {
            assert!(shard.output_dir.is_dir());
            assert!(!shard.output_dir.join("text").exists());
        }

        let err = crate::aggregate::Aggregator::stream("text")
            .merge(&rerun, &dir.path().join("merged"), "t")
            .unwrap_err();
        assert_eq!(err.code(), "AGGREGATION_MISMATCH");
    }

    #[tokio::test]
    async fn test_failure_lists_every_failed_shard() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let backend = Arc::new(MockBackend::new().failing_on([2, 4]));
        let dispatcher = JobDispatcher::new(backend).with_events(events.clone());

        let task = StageTask::new("decode", CommandSpec::new("decode"), dir.path())
            .with_manifest(manifest(4))
            .with_parallelism(4);
        let err = dispatcher.run_stage_task(&task).await.unwrap_err();

        let ShardflowError::ShardJobFailure(failure) = err else {
            panic!("expected shard failure");
        };
        assert_eq!(failure.failed_indices(), vec![2, 4]);
        assert_eq!(failure.total_jobs, 4);
        assert_eq!(events.of_type("shard.failed").len(), 2);
        assert_eq!(events.of_type("shard.completed").len(), 2);
    }

    #[tokio::test]
    async fn test_missing_result_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockBackendAdapter::new();
        mock.expect_kind().return_const(BackendKind::Local);
        mock.expect_submit()
            .times(1)
            .returning(|_, _| Ok(vec![JobResult::exited(1, 0)]));

        let dispatcher = JobDispatcher::new(Arc::new(mock));
        let task = StageTask::new("x", CommandSpec::new("x"), dir.path())
            .with_manifest(manifest(2))
            .with_parallelism(2);

        let err = dispatcher.run_stage_task(&task).await.unwrap_err();
        assert_eq!(err.code(), "SHARD_JOB_FAILURE");
        assert!(err.to_string().contains("backend reported no result"));
    }

    #[tokio::test]
    async fn test_unfinished_result_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockBackendAdapter::new();
        mock.expect_kind().return_const(BackendKind::Local);
        mock.expect_submit()
            .returning(|_, _| Ok(vec![JobResult::pending(1).start()]));

        let dispatcher = JobDispatcher::new(Arc::new(mock));
        let task = StageTask::new("x", CommandSpec::new("x"), dir.path());

        let ShardflowError::ShardJobFailure(failure) = dispatcher.run_stage_task(&task).await.unwrap_err() else {
            panic!("expected shard failure");
        };
        assert_eq!(failure.failed_indices(), vec![1]);
        assert_eq!(failure.failures[0].reason, "backend returned the job while running");
    }

    #[tokio::test]
    async fn test_submission_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockBackendAdapter::new();
        mock.expect_kind().return_const(BackendKind::Slurm);
        mock.expect_submit().returning(|batch, _| {
            Err(BackendSubmissionError::new("slurm", &batch.name, "queue closed").into())
        });

        let dispatcher = JobDispatcher::new(Arc::new(mock));
        let task = StageTask::new("lm", CommandSpec::new("train-lm"), dir.path());

        let err = dispatcher.run_stage_task(&task).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_SUBMISSION");
    }

    #[tokio::test]
    async fn test_empty_manifest_never_submits() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockBackendAdapter::new();
        mock.expect_submit().never();

        let dispatcher = JobDispatcher::new(Arc::new(mock));
        let empty = Arc::new(WorkManifest::from_ids("empty", Vec::<String>::new()).unwrap());
        let task = StageTask::new("x", CommandSpec::new("x"), dir.path()).with_manifest(empty);

        let err = dispatcher.run_stage_task(&task).await.unwrap_err();
        assert_eq!(err.code(), "EMPTY_MANIFEST");
    }

    #[tokio::test]
    async fn test_zero_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(Arc::new(MockBackend::new()));
        let task = StageTask::new("x", CommandSpec::new("x"), dir.path()).with_parallelism(0);
        assert!(dispatcher.run_stage_task(&task).await.unwrap_err().is_configuration());
    }
}
