//! Cluster scheduler backend (grid-engine and Slurm).
//!
//! A batch is submitted as one array job. Its script, `<log_dir>/q/<task>.sh`,
//! picks the command for its array index, runs it with output redirected to
//! the job log and finally writes the exit status to
//! `<log_dir>/q/done.<index>`. Completion is observed by polling for the done
//! markers. Between polls the table's status command is asked whether the
//! array job is still known to the scheduler; once it has been gone for the
//! grace period, tasks without a marker are reported failed.

use super::{
    shell_quote, BackendAdapter, BackendKind, JobBatch, JobResult, OptionTable, RenderedCommand,
    ResourceRequest,
};
use crate::core::iso_timestamp;
use crate::errors::{BackendSubmissionError, ConfigurationError, ShardflowResult};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default interval between done-marker polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long a job may be gone from the queue before its missing done markers
/// count as failures. Covers markers still in flight on shared filesystems.
pub const DEFAULT_MARKER_GRACE: Duration = Duration::from_secs(60);

static JOB_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("job id pattern"));

/// Submits jobs to a cluster scheduler and waits for their done markers.
#[derive(Debug, Clone)]
pub struct QueueBackend {
    kind: BackendKind,
    table: OptionTable,
    status: Vec<String>,
    poll_interval: Duration,
    marker_grace: Duration,
    timeout: Option<Duration>,
}

impl QueueBackend {
    /// Creates a queue backend driven by `table`.
    ///
    /// A table without a `status` line falls back to the scheduler's
    /// built-in status command.
    #[must_use]
    pub fn new(kind: BackendKind, table: OptionTable) -> Self {
        let status = if table.status_command().is_empty() {
            kind.default_table().status_command().to_vec()
        } else {
            table.status_command().to_vec()
        };
        Self {
            kind,
            table,
            status,
            poll_interval: DEFAULT_POLL_INTERVAL,
            marker_grace: DEFAULT_MARKER_GRACE,
            timeout: None,
        }
    }

    /// Grid-engine backend with the built-in table.
    #[must_use]
    pub fn grid_engine() -> Self {
        Self::new(BackendKind::GridEngine, OptionTable::grid_engine())
    }

    /// Slurm backend with the built-in table.
    #[must_use]
    pub fn slurm() -> Self {
        Self::new(BackendKind::Slurm, OptionTable::slurm())
    }

    /// Sets the done-marker poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long a job may be gone from the queue before its missing
    /// markers are reported as failures.
    #[must_use]
    pub fn with_marker_grace(mut self, grace: Duration) -> Self {
        self.marker_grace = grace;
        self
    }

    /// Jobs without a done marker after `timeout` are reported failed.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn rejected(&self, batch: &JobBatch, message: impl Into<String>) -> BackendSubmissionError {
        BackendSubmissionError::new(self.kind.to_string(), &batch.name, message)
    }

    /// Runs the submission command and returns the scheduler's job id.
    async fn submit_array(
        &self,
        batch: &JobBatch,
        flags: &[String],
        script: &Path,
        queue_log: &Path,
    ) -> ShardflowResult<String> {
        let (program, fixed) = self
            .table
            .command()
            .split_first()
            .ok_or_else(|| ConfigurationError::new("queue config has no command line").with_key("queue_conf"))?;

        let output = Command::new(program)
            .args(fixed)
            .args(flags)
            .arg("-o")
            .arg(queue_log)
            .arg(script)
            .output()
            .await
            .map_err(|e| self.rejected(batch, format!("cannot run '{program}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self
                .rejected(
                    batch,
                    format!(
                        "'{program}' exited with {}: {}",
                        output.status,
                        stderr.trim()
                    ),
                )
                .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = JOB_ID.find(&stdout).map(|m| m.as_str().to_string()).ok_or_else(|| {
            self.rejected(
                batch,
                format!("no job id in the output of '{program}': '{}'", stdout.trim()),
            )
        })?;

        debug!(
            task = %batch.name,
            job_id = %job_id,
            script = %script.display(),
            "Submitted array job"
        );
        Ok(job_id)
    }

    /// Asks the scheduler whether the job is still queued or running.
    ///
    /// Without a status command, or if it cannot be run, the job is assumed
    /// alive and only the timeout ends the wait.
    async fn job_alive(&self, job_id: &str) -> bool {
        let Some((program, fixed)) = self.status.split_first() else {
            return true;
        };
        match Command::new(program).args(fixed).arg(job_id).output().await {
            Ok(output) => output.status.success() && !output.stdout.trim_ascii().is_empty(),
            Err(e) => {
                warn!(job_id = %job_id, program = %program, error = %e, "Cannot query job status");
                true
            }
        }
    }

    async fn wait_for_markers(
        &self,
        batch: &JobBatch,
        queue_dir: &Path,
        job_id: &str,
        submitted_at: &str,
    ) -> Vec<JobResult> {
        let clock = Instant::now();
        let mut finished: BTreeMap<usize, JobResult> = BTreeMap::new();
        let mut gone_since: Option<Instant> = None;

        loop {
            collect_markers(batch, queue_dir, &mut finished);
            if finished.len() == batch.job_count {
                break;
            }

            if self.timeout.is_some_and(|t| clock.elapsed() >= t) {
                warn!(
                    task = %batch.name,
                    job_id = %job_id,
                    pending = batch.job_count - finished.len(),
                    "Timed out waiting for jobs"
                );
                fail_pending(batch, &mut finished, "timed out waiting for job");
                break;
            }

            if self.job_alive(job_id).await {
                gone_since = None;
            } else {
                let since = *gone_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.marker_grace {
                    collect_markers(batch, queue_dir, &mut finished);
                    if finished.len() < batch.job_count {
                        warn!(
                            task = %batch.name,
                            job_id = %job_id,
                            pending = batch.job_count - finished.len(),
                            "Job left the queue without writing an exit status"
                        );
                    }
                    let reason = format!("job {job_id} left the queue without an exit status");
                    fail_pending(batch, &mut finished, &reason);
                    break;
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        finished
            .into_values()
            .map(|r| {
                let index = r.index;
                r.with_log(batch.log_path(index))
                    .with_started_at(submitted_at)
            })
            .collect()
    }
}

#[async_trait]
impl BackendAdapter for QueueBackend {
    fn kind(&self) -> BackendKind {
        self.kind
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
        let mut request = resources.clone();
        if self.table.supports("name") && !request.contains("name") {
            request = request.name(&batch.name);
        }
        let mut flags = self.table.render_flags(&request)?;
        flags.extend(array_flags(self.kind, batch.job_count, request.max_jobs_run_value()?));

        if let Some(program) = self.table.command().first() {
            which::which(program)
                .map_err(|e| self.rejected(batch, format!("cannot find '{program}': {e}")))?;
        }

        let queue_dir = batch.log_dir.join("q");
        std::fs::create_dir_all(&queue_dir)
            .map_err(|e| self.rejected(batch, format!("cannot create {}: {e}", queue_dir.display())))?;
        for index in batch.indices() {
            let marker = done_marker(&queue_dir, index);
            if marker.exists() {
                std::fs::remove_file(&marker)?;
            }
        }

        let cwd = std::env::current_dir()?;
        let commands: Vec<RenderedCommand> =
            batch.indices().map(|i| batch.command.render(i)).collect();
        let script = queue_dir.join(format!("{}.sh", batch.name));
        std::fs::write(
            &script,
            render_script(task_id_var(self.kind), batch, &commands, &cwd, &queue_dir),
        )?;

        let submitted_at = iso_timestamp();
        info!(
            backend = %self.kind,
            task = %batch.name,
            jobs = batch.job_count,
            flags = %flags.join(" "),
            "Submitting array job"
        );
        let queue_log = queue_log(self.kind, &queue_dir, &batch.name);
        let job_id = self.submit_array(batch, &flags, &script, &queue_log).await?;

        Ok(self
            .wait_for_markers(batch, &queue_dir, &job_id, &submitted_at)
            .await)
    }
}

/// Array flags for `jobs` tasks. Slurm carries the concurrency cap in the
/// array spec; grid-engine gets `-tc` from the option table.
fn array_flags(kind: BackendKind, jobs: usize, max_jobs_run: Option<usize>) -> Vec<String> {
    match kind {
        BackendKind::Slurm => {
            let cap = max_jobs_run.map(|k| format!("%{k}")).unwrap_or_default();
            vec![format!("--array=1-{jobs}{cap}")]
        }
        BackendKind::GridEngine | BackendKind::Local => vec!["-t".to_string(), format!("1:{jobs}")],
    }
}

/// Environment variable holding the array index inside a task.
fn task_id_var(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Slurm => "SLURM_ARRAY_TASK_ID",
        BackendKind::GridEngine | BackendKind::Local => "SGE_TASK_ID",
    }
}

/// Scheduler-side stdout path, with the scheduler's own index pattern.
fn queue_log(kind: BackendKind, queue_dir: &Path, name: &str) -> PathBuf {
    match kind {
        BackendKind::Slurm => queue_dir.join(format!("{name}.%a.log")),
        BackendKind::GridEngine | BackendKind::Local => queue_dir.join(format!("{name}.$TASK_ID.log")),
    }
}

fn done_marker(queue_dir: &Path, index: usize) -> PathBuf {
    queue_dir.join(format!("done.{index}"))
}

fn read_marker(marker: &Path, index: usize) -> Option<JobResult> {
    let text = std::fs::read_to_string(marker).ok()?;
    Some(match text.trim().parse::<i32>() {
        Ok(code) => JobResult::exited(index, code),
        Err(_) => JobResult::failed(index, format!("unreadable done marker '{}'", text.trim())),
    })
}

fn collect_markers(batch: &JobBatch, queue_dir: &Path, finished: &mut BTreeMap<usize, JobResult>) {
    for index in batch.indices() {
        if finished.contains_key(&index) {
            continue;
        }
        if let Some(result) = read_marker(&done_marker(queue_dir, index), index) {
            finished.insert(index, result);
        }
    }
}

fn fail_pending(batch: &JobBatch, finished: &mut BTreeMap<usize, JobResult>, reason: &str) {
    for index in batch.indices() {
        finished
            .entry(index)
            .or_insert_with(|| JobResult::failed(index, reason));
    }
}

/// Renders the POSIX shell script for an array job.
///
/// The index comes from `task_var`, or from the first argument when the
/// variable is unset.
fn render_script(
    task_var: &str,
    batch: &JobBatch,
    commands: &[RenderedCommand],
    cwd: &Path,
    queue_dir: &Path,
) -> String {
    let mut script = String::from("#!/bin/sh\n");
    let _ = writeln!(script, "task=${{{task_var}:-$1}}");
    script.push_str("case \"$task\" in\n");

    for command in commands {
        let index = command.index;
        let dir = command.cwd.as_deref().unwrap_or(cwd);
        let line = command.to_shell_line();

        let _ = writeln!(script, "{index})");
        let _ = writeln!(script, "  log={}", shell_quote(&batch.log_path(index).display().to_string()));
        let _ = writeln!(
            script,
            "  marker={}",
            shell_quote(&done_marker(queue_dir, index).display().to_string())
        );
        let _ = writeln!(script, "  echo {} > \"$log\"", shell_quote(&format!("# {line}")));
        script.push_str("  echo \"# Started at $(date)\" >> \"$log\"\n");
        let _ = write!(script, "  ( cd {} || exit 1", shell_quote(&dir.display().to_string()));
        for (key, value) in &command.env {
            let _ = write!(script, "; {key}={}; export {key}", shell_quote(value));
        }
        let _ = writeln!(script, "; {line} ) >> \"$log\" 2>&1");
        script.push_str("  rc=$?\n  ;;\n");
    }

    script.push_str("*)\n  echo \"unknown task index '$task'\" >&2\n  exit 1\n  ;;\nesac\n");
    script.push_str("echo \"# Ended (code $rc) at $(date)\" >> \"$log\"\n");
    script.push_str("echo $rc > \"$marker.tmp\" && mv \"$marker.tmp\" \"$marker\"\n");
    script.push_str("exit $rc\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandSpec;
    use crate::core::JobStatus;

    /// A fake scheduler. `submit` is the submitter's shell body; the status
    /// command reports the job gone.
    fn fake_table(submit: &str) -> OptionTable {
        OptionTable::new(["sh", "-c", submit, "fake-submit"])
            .with_status_command(["sh", "-c", "exit 1"])
            .with_option("name", "*", "-N $0")
            .with_option("max_jobs_run", "*", "")
            .with_option("gpu", "0", "")
            .with_default("gpu", "0")
    }

    /// Runs every array task of the script, then prints a job id.
    const RUN_ARRAY: &str = r#"
for a; do
  case "$a" in --array=*) n=${a#--array=1-}; n=${n%%%*};; esac
  last=$a
done
i=1
while [ "$i" -le "$n" ]; do SLURM_ARRAY_TASK_ID=$i sh "$last"; i=$((i+1)); done
echo "Submitted batch job 4242""#;

    /// Accepts the job but never runs it.
    const ACCEPT_ONLY: &str = r#"echo "Submitted batch job 4243""#;

    fn backend(submit: &str) -> QueueBackend {
        QueueBackend::new(BackendKind::Slurm, fake_table(submit))
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_jobs_complete_via_done_markers() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::new("sh").args(["-c", "echo hello $0; [ \"$0\" != 3 ]", "JOB"]);
        let batch = JobBatch::new("tok", command, 3, dir.path().join("log"));

        let results = backend(RUN_ARRAY)
            .submit(&batch, &ResourceRequest::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, JobStatus::Succeeded);
        assert_eq!(results[2].status, JobStatus::Failed);
        assert_eq!(results[2].exit_code, Some(1));

        let log = std::fs::read_to_string(batch.log_path(2)).unwrap();
        assert!(log.contains("hello 2"));
        assert!(log.contains("# Ended (code 0)"));
        assert!(dir.path().join("log/q/tok.sh").exists());
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let dir = tempfile::tempdir().unwrap();
        let batch = JobBatch::new("lm", CommandSpec::new("true"), 2, dir.path().join("log"));

        let err = backend("echo queue full >&2; exit 3")
            .submit(&batch, &ResourceRequest::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BACKEND_SUBMISSION");
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn test_submission_without_job_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let batch = JobBatch::new("lm", CommandSpec::new("true"), 2, dir.path().join("log"));

        let err = backend("exit 0")
            .submit(&batch, &ResourceRequest::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BACKEND_SUBMISSION");
        assert!(err.to_string().contains("no job id"));
    }

    #[tokio::test]
    async fn test_job_gone_from_queue_without_marker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let batch = JobBatch::new("lm", CommandSpec::new("true"), 2, dir.path().join("log"));
        let backend = QueueBackend::new(BackendKind::Slurm, fake_table(ACCEPT_ONLY))
            .with_poll_interval(Duration::from_millis(10))
            .with_marker_grace(Duration::ZERO);

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            backend.submit(&batch, &ResourceRequest::new()),
        )
        .await
        .expect("barrier returns once the job has left the queue")
        .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == JobStatus::Failed));
        assert_eq!(
            results[1].message.as_deref(),
            Some("job 4243 left the queue without an exit status")
        );
    }

    #[tokio::test]
    async fn test_timeout_marks_jobs_failed() {
        let dir = tempfile::tempdir().unwrap();
        let batch = JobBatch::new("lm", CommandSpec::new("true"), 2, dir.path().join("log"));
        let table = fake_table(ACCEPT_ONLY).with_status_command(["sh", "-c", "echo \"$0 PENDING\""]);

        let results = QueueBackend::new(BackendKind::Slurm, table)
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_millis(50))
            .submit(&batch, &ResourceRequest::new())
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.status == JobStatus::Failed));
        assert_eq!(results[0].message.as_deref(), Some("timed out waiting for job"));
    }

    #[tokio::test]
    async fn test_unknown_resource_rejected_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let batch = JobBatch::new("lm", CommandSpec::new("true"), 1, dir.path().join("log"));
        let backend = backend(RUN_ARRAY);

        assert!(backend
            .validate_resources(&ResourceRequest::new().gpu(2))
            .unwrap_err()
            .is_configuration());

        let err = backend
            .submit(&batch, &ResourceRequest::new().gpu(2))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(!dir.path().join("log/q").exists());
    }

    #[test]
    fn test_array_flags() {
        assert_eq!(array_flags(BackendKind::Slurm, 4, None), vec!["--array=1-4"]);
        assert_eq!(array_flags(BackendKind::Slurm, 4, Some(2)), vec!["--array=1-4%2"]);
        assert_eq!(array_flags(BackendKind::GridEngine, 4, Some(2)), vec!["-t", "1:4"]);

        let sge = OptionTable::grid_engine()
            .render_flags(&ResourceRequest::new().max_jobs_run(2))
            .unwrap();
        assert!(sge.windows(2).any(|w| w == ["-tc", "2"]));
    }

    #[test]
    fn test_missing_status_line_uses_builtin_command() {
        let backend = QueueBackend::new(BackendKind::GridEngine, OptionTable::new(["qsub"]));
        assert_eq!(backend.status, vec!["qstat", "-j"]);
    }

    #[test]
    fn test_render_script() {
        let rendered = CommandSpec::new("decode")
            .args(["--keys", "keys.JOB.scp"])
            .env("OMP_NUM_THREADS", "1")
            .render(2);
        let batch = JobBatch::new("decode", CommandSpec::new("decode"), 2, "/work/log");
        let script = render_script(
            "SGE_TASK_ID",
            &batch,
            &[rendered],
            Path::new("/work"),
            Path::new("/work/log/q"),
        );

        assert!(script.starts_with("#!/bin/sh\ntask=${SGE_TASK_ID:-$1}\ncase \"$task\" in\n2)\n"));
        assert!(script.contains("  log=/work/log/decode.2.log\n"));
        assert!(script.contains(
            "  ( cd /work || exit 1; OMP_NUM_THREADS=1; export OMP_NUM_THREADS; \
             decode --keys keys.2.scp ) >> \"$log\" 2>&1\n"
        ));
        assert!(script.contains("mv \"$marker.tmp\" \"$marker\"\n"));
    }
}
