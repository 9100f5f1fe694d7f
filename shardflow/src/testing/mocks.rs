//! Mock backend and stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backend::{
    BackendAdapter, BackendKind, JobBatch, JobResult, OptionTable, RenderedCommand,
    ResourceRequest,
};
use crate::config::RunConfig;
use crate::errors::{BackendSubmissionError, ConfigurationError, ShardflowError, ShardflowResult};
use crate::pipeline::{StageContext, StageOutput};
use crate::stages::Stage;

/// Work performed in-process for one mock job.
pub type JobFn = Arc<dyn Fn(&RenderedCommand) -> std::io::Result<()> + Send + Sync>;

/// A batch observed by [`MockBackend`].
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    /// Batch name.
    pub name: String,
    /// Number of jobs.
    pub job_count: usize,
    /// Resources requested.
    pub resources: ResourceRequest,
    /// Commands rendered for each index.
    pub commands: Vec<RenderedCommand>,
}

/// An in-process backend with scripted outcomes.
///
/// Jobs succeed unless their index is listed in `failing_on`. An optional
/// job function runs for every non-failing job, so tests can write shard
/// outputs without spawning processes. Resources are accepted as-is unless
/// an option table is set.
#[derive(Default)]
pub struct MockBackend {
    failing: BTreeSet<usize>,
    reject: Option<String>,
    table: Option<OptionTable>,
    job: Option<JobFn>,
    batches: Mutex<Vec<RecordedBatch>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("failing", &self.failing)
            .field("reject", &self.reject)
            .field("batches", &self.batches.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockBackend {
    /// Creates a backend where every job succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the jobs with these indices exit 1.
    #[must_use]
    pub fn failing_on(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(indices);
        self
    }

    /// Validates resources against `table`.
    #[must_use]
    pub fn with_table(mut self, table: OptionTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Rejects every batch before execution.
    #[must_use]
    pub fn rejecting(mut self, message: impl Into<String>) -> Self {
        self.reject = Some(message.into());
        self
    }

    /// Runs `job` for every succeeding job.
    #[must_use]
    pub fn with_job<F>(mut self, job: F) -> Self
    where
        F: Fn(&RenderedCommand) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.job = Some(Arc::new(job));
        self
    }

    /// All recorded batches.
    #[must_use]
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().clone()
    }

    /// Number of submitted batches.
    #[must_use]
    pub fn submissions(&self) -> usize {
        self.batches.lock().len()
    }

    /// Total jobs over all batches.
    #[must_use]
    pub fn total_jobs(&self) -> usize {
        self.batches.lock().iter().map(|b| b.job_count).sum()
    }

    /// Every rendered command, in submission order.
    #[must_use]
    pub fn rendered_commands(&self) -> Vec<RenderedCommand> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.commands.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn validate_resources(&self, resources: &ResourceRequest) -> ShardflowResult<()> {
        match &self.table {
            Some(table) => table.validate(resources),
            None => Ok(()),
        }
    }

    async fn submit(
        &self,
        batch: &JobBatch,
        resources: &ResourceRequest,
    ) -> ShardflowResult<Vec<JobResult>> {
        self.validate_resources(resources)?;
        if let Some(message) = &self.reject {
            return Err(BackendSubmissionError::new("mock", &batch.name, message.clone()).into());
        }

        let commands: Vec<RenderedCommand> =
            batch.indices().map(|i| batch.command.render(i)).collect();
        self.batches.lock().push(RecordedBatch {
            name: batch.name.clone(),
            job_count: batch.job_count,
            resources: resources.clone(),
            commands: commands.clone(),
        });

        let results = commands
            .iter()
            .map(|command| {
                let index = command.index;
                let log = batch.log_path(index);
                if self.failing.contains(&index) {
                    return JobResult::exited(index, 1).with_log(log);
                }
                match &self.job {
                    Some(job) => match job(command) {
                        Ok(()) => JobResult::exited(index, 0).with_log(log),
                        Err(e) => JobResult::exited(index, 1).with_log(log).with_message(e.to_string()),
                    },
                    None => JobResult::exited(index, 0).with_log(log),
                }
            })
            .collect();
        Ok(results)
    }
}

/// A stage that counts its calls and always succeeds.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    calls: Mutex<Vec<u32>>,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of times the stage ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Stage ids seen on each call.
    #[must_use]
    pub fn recorded_ids(&self) -> Vec<u32> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> ShardflowResult<StageOutput> {
        self.calls.lock().push(ctx.stage_id());
        Ok(StageOutput::ok())
    }
}

/// A stage that always fails at runtime.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: String,
}

impl FailingStage {
    /// Creates a stage failing with `error`.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> ShardflowResult<StageOutput> {
        Err(std::io::Error::other(self.error.clone()).into())
    }
}

/// A stage whose configuration is rejected before the run starts.
#[derive(Debug)]
pub struct MisconfiguredStage {
    name: String,
}

impl MisconfiguredStage {
    /// Creates a misconfigured stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn error(&self) -> ShardflowError {
        ConfigurationError::new(format!("stage '{}' is missing its config", self.name)).into()
    }
}

#[async_trait]
impl Stage for MisconfiguredStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self, _config: &RunConfig, _backend: &dyn BackendAdapter) -> ShardflowResult<()> {
        Err(self.error())
    }

    async fn execute(&self, _ctx: &StageContext) -> ShardflowResult<StageOutput> {
        Err(self.error())
    }
}
