//! Local process-pool backend.

use super::{BackendAdapter, BackendKind, JobBatch, JobResult, OptionTable, ResourceRequest};
use crate::core::iso_timestamp;
use crate::errors::{BackendSubmissionError, ShardflowResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Runs each job as a child process of this host.
///
/// At most `max_jobs_run` jobs run at once; without a limit every job of the
/// batch is started immediately. Each job's stdout and stderr go to its log
/// file.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    table: OptionTable,
    max_jobs_run: Option<usize>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Creates a local backend with the built-in option table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: OptionTable::local(),
            max_jobs_run: None,
        }
    }

    /// Replaces the option table used to validate resource requests.
    #[must_use]
    pub fn with_table(mut self, table: OptionTable) -> Self {
        self.table = table;
        self
    }

    /// Sets the default concurrency cap.
    #[must_use]
    pub fn with_max_jobs_run(mut self, max_jobs_run: usize) -> Self {
        self.max_jobs_run = Some(max_jobs_run.max(1));
        self
    }

    fn preflight(&self, batch: &JobBatch) -> ShardflowResult<()> {
        let program = batch.command.program();
        which::which(program).map_err(|e| {
            BackendSubmissionError::new(
                BackendKind::Local.to_string(),
                &batch.name,
                format!("cannot execute '{program}': {e}"),
            )
        })?;
        std::fs::create_dir_all(&batch.log_dir).map_err(|e| {
            BackendSubmissionError::new(
                BackendKind::Local.to_string(),
                &batch.name,
                format!("cannot create log dir {}: {e}", batch.log_dir.display()),
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn validate_resources(&self, resources: &ResourceRequest) -> ShardflowResult<()> {
        self.table.validate(resources)?;
        resources.max_jobs_run_value()?;
        Ok(())
    }

    async fn submit(
        &self,
        batch: &JobBatch,
        resources: &ResourceRequest,
    ) -> ShardflowResult<Vec<JobResult>> {
        self.validate_resources(resources)?;
        self.preflight(batch)?;

        let limit = resources
            .max_jobs_run_value()?
            .or(self.max_jobs_run)
            .unwrap_or(batch.job_count)
            .max(1);
        info!(
            task = %batch.name,
            jobs = batch.job_count,
            max_jobs_run = limit,
            "Starting local jobs"
        );

        let permits = Arc::new(Semaphore::new(limit));
        let jobs = batch
            .indices()
            .map(|index| run_job(batch, index, Arc::clone(&permits)));
        Ok(join_all(jobs).await)
    }
}

async fn run_job(batch: &JobBatch, index: usize, permits: Arc<Semaphore>) -> JobResult {
    let log_path = batch.log_path(index);
    let job = JobResult::pending(index).with_log(&log_path);
    let Ok(_permit) = permits.acquire_owned().await else {
        return job.fail("job pool closed");
    };

    let rendered = batch.command.render(index);
    let job = job.start();
    let started_at = job.started_at.clone().unwrap_or_default();
    let clock = Instant::now();

    let stdout = match open_log(&log_path, &rendered.to_shell_line(), &started_at) {
        Ok(file) => file,
        Err(e) => {
            warn!(task = %batch.name, shard = index, error = %e, "Cannot open job log");
            return job.fail(format!("cannot open log: {e}"));
        }
    };
    let stderr = match stdout.try_clone() {
        Ok(file) => file,
        Err(e) => return job.fail(format!("cannot open log: {e}")),
    };

    let mut command = Command::new(&rendered.program);
    command
        .args(&rendered.args)
        .envs(&rendered.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(cwd) = &rendered.cwd {
        command.current_dir(cwd);
    }

    debug!(task = %batch.name, shard = index, command = %rendered.to_shell_line(), "Spawning job");
    let result = match command.status().await {
        Ok(status) => match status.code() {
            Some(code) => job.finish(code),
            None => job.fail("terminated by signal"),
        },
        Err(e) => job.fail(format!("failed to spawn: {e}")),
    };

    let elapsed = clock.elapsed().as_secs();
    let code = result
        .exit_code
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    if let Err(e) = append_footer(&log_path, elapsed, &code) {
        warn!(task = %batch.name, shard = index, error = %e, "Cannot finalize job log");
    }

    debug!(
        task = %batch.name,
        shard = index,
        status = %result.status,
        exit_code = %code,
        elapsed_secs = elapsed,
        "Job finished"
    );
    result
}

fn open_log(path: &std::path::Path, line: &str, started_at: &str) -> std::io::Result<File> {
    let mut file = File::create(path)?;
    writeln!(file, "# {line}")?;
    writeln!(file, "# Started at {started_at}")?;
    file.flush()?;
    Ok(file)
}

fn append_footer(path: &std::path::Path, elapsed: u64, code: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    writeln!(file, "# Accounting: time={elapsed} threads=1")?;
    writeln!(
        file,
        "# Ended (code {code}) at {}, elapsed time {elapsed} seconds",
        iso_timestamp()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandSpec;
    use crate::core::JobStatus;

    fn batch(dir: &std::path::Path, command: CommandSpec, jobs: usize) -> JobBatch {
        JobBatch::new("test", command, jobs, dir.join("log"))
    }

    #[tokio::test]
    async fn test_runs_every_job() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let command = CommandSpec::new("sh")
            .args(["-c", "echo shard $0 > \"$1\"", "JOB"])
            .arg(out.join("JOB.txt").display().to_string());
        let b = batch(dir.path(), command, 3);

        let results = LocalBackend::new()
            .submit(&b, &ResourceRequest::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(JobResult::is_success));
        assert_eq!(
            results.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let text = std::fs::read_to_string(out.join("2.txt")).unwrap();
        assert_eq!(text, "shard 2\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::new("sh").args(["-c", "echo oops >&2; [ \"$0\" != 2 ] || exit 7", "JOB"]);
        let b = batch(dir.path(), command, 3);

        let results = LocalBackend::new()
            .with_max_jobs_run(1)
            .submit(&b, &ResourceRequest::new())
            .await
            .unwrap();

        assert_eq!(results[0].status, JobStatus::Succeeded);
        assert_eq!(results[1].status, JobStatus::Failed);
        assert_eq!(results[1].exit_code, Some(7));

        let log = std::fs::read_to_string(b.log_path(2)).unwrap();
        assert!(log.starts_with("# sh -c"));
        assert!(log.contains("oops"));
        assert!(log.contains("# Ended (code 7)"));
    }

    #[tokio::test]
    async fn test_missing_program_rejects_batch() {
        let dir = tempfile::tempdir().unwrap();
        let b = batch(dir.path(), CommandSpec::new("shardflow-no-such-program"), 2);

        let err = LocalBackend::new()
            .submit(&b, &ResourceRequest::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BACKEND_SUBMISSION");
    }

    #[tokio::test]
    async fn test_unknown_resource_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let b = batch(dir.path(), CommandSpec::new("true"), 1);

        let err = LocalBackend::new()
            .submit(&b, &ResourceRequest::new().with("queue", "long"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_max_jobs_run_limits_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("running");
        std::fs::create_dir_all(&marker).unwrap();

        // Each job fails if it observes another running job.
        let script = format!(
            "d='{}'; n=$(ls \"$d\" | wc -l); touch \"$d/$0\"; sleep 0.05; rm \"$d/$0\"; [ \"$n\" -eq 0 ]",
            marker.display()
        );
        let b = batch(dir.path(), CommandSpec::new("sh").args(["-c", script.as_str(), "JOB"]), 4);

        let results = LocalBackend::new()
            .submit(&b, &ResourceRequest::new().max_jobs_run(1))
            .await
            .unwrap();
        assert!(results.iter().all(JobResult::is_success));
    }
}
