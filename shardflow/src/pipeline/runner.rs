//! Sequential, range-gated, fail-fast stage execution.

use super::{Pipeline, StageContext};
use crate::config::RunConfig;
use crate::core::{ArtifactDirectory, RunState};
use crate::dispatch::JobDispatcher;
use crate::errors::{ShardflowError, ShardflowResult};
use crate::events::{EventSink, NoOpEventSink};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// One executed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// Stage id.
    pub id: u32,
    /// Stage name.
    pub name: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Artifacts the stage produced.
    pub artifacts: Vec<ArtifactDirectory>,
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Final state.
    pub state: RunState,
    /// The selected range after clamping, if any stage was selected.
    pub range: Option<(u32, u32)>,
    /// Stages that ran to success, in order.
    pub executed: Vec<StageRecord>,
    /// In-range stages skipped by configuration.
    pub skipped: Vec<u32>,
}

impl RunReport {
    /// Ids of the stages that ran to success.
    #[must_use]
    pub fn executed_ids(&self) -> Vec<u32> {
        self.executed.iter().map(|s| s.id).collect()
    }
}

/// Runs a pipeline's stages in id order, gated by the configured range.
///
/// The first failing stage moves the runner to [`RunState::Failed`] and no
/// later stage runs.
pub struct StageRunner {
    pipeline: Pipeline,
    config: Arc<RunConfig>,
    dispatcher: Arc<JobDispatcher>,
    events: Arc<dyn EventSink>,
    run_id: Uuid,
    state: RunState,
    report: Option<RunReport>,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("pipeline", &self.pipeline.name())
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(pipeline: Pipeline, config: Arc<RunConfig>, dispatcher: Arc<JobDispatcher>) -> Self {
        Self {
            pipeline,
            config,
            dispatcher,
            events: Arc::new(NoOpEventSink),
            run_id: Uuid::now_v7(),
            state: RunState::NotStarted,
            report: None,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Identifier of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Report of the last run, whether it succeeded or failed.
    #[must_use]
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    /// Ids of the stages the configuration selects, in run order.
    #[must_use]
    pub fn active_stage_ids(&self) -> Vec<u32> {
        let Some(range) = self.selected_range() else {
            return Vec::new();
        };
        self.pipeline
            .stages()
            .iter()
            .filter(|s| range.contains(&s.id) && !self.config.skip_stages.contains(&s.id))
            .map(|s| s.id)
            .collect()
    }

    fn preflight(&self) -> ShardflowResult<()> {
        let active = self.active_stage_ids();
        let backend = self.dispatcher.backend();
        for spec in self.pipeline.stages().iter().filter(|s| active.contains(&s.id)) {
            if let Err(e) = spec.runner.preflight(&self.config, backend.as_ref()) {
                error!(
                    stage_id = spec.id,
                    stage = %spec.name,
                    error = %e,
                    "Stage rejected before the run started"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn selected_range(&self) -> Option<std::ops::RangeInclusive<u32>> {
        let (min, max) = self.pipeline.bounds()?;
        self.config.stage_range.clamp(min, max)
    }

    /// Runs every selected stage.
    ///
    /// # Errors
    ///
    /// A configuration error if the run configuration is invalid or a
    /// selected stage fails its preflight check (no stage runs), otherwise [`ShardflowError::StageFailed`] wrapping the first
    /// stage failure.
    pub async fn run(&mut self) -> ShardflowResult<RunReport> {
        self.config.validate()?;
        self.preflight()?;

        let range = self.selected_range();
        let mut report = RunReport {
            run_id: self.run_id,
            pipeline: self.pipeline.name().to_string(),
            state: RunState::NotStarted,
            range: range.as_ref().map(|r| (*r.start(), *r.end())),
            executed: Vec::new(),
            skipped: Vec::new(),
        };

        info!(
            pipeline = %self.pipeline.name(),
            run_id = %self.run_id,
            range = ?report.range,
            "Pipeline started"
        );
        self.events.try_emit(
            "pipeline.started",
            Some(json!({
                "pipeline": self.pipeline.name(),
                "run_id": self.run_id.to_string(),
                "range": report.range,
            })),
        );

        let stages = self.pipeline.stages().to_vec();
        for spec in stages {
            if !range.as_ref().is_some_and(|r| r.contains(&spec.id)) {
                continue;
            }

            if self.config.skip_stages.contains(&spec.id) {
                info!(stage_id = spec.id, stage = %spec.name, "Stage skipped");
                self.events.try_emit(
                    "stage.skipped",
                    Some(json!({"stage_id": spec.id, "stage": spec.name})),
                );
                report.skipped.push(spec.id);
                continue;
            }

            self.state = RunState::Running { stage_id: spec.id };
            info!(stage_id = spec.id, stage = %spec.name, "Stage started");
            self.events.try_emit(
                "stage.started",
                Some(json!({"stage_id": spec.id, "stage": spec.name})),
            );

            let ctx = StageContext::new(
                spec.id,
                &spec.name,
                self.run_id,
                Arc::clone(&self.config),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.events),
            );
            let clock = Instant::now();
            let outcome = spec.runner.execute(&ctx).await;
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(output) => {
                    info!(
                        stage_id = spec.id,
                        stage = %spec.name,
                        duration_ms,
                        artifacts = output.artifacts.len(),
                        "Stage completed"
                    );
                    self.events.try_emit(
                        "stage.completed",
                        Some(json!({
                            "stage_id": spec.id,
                            "stage": spec.name,
                            "duration_ms": duration_ms,
                            "artifacts": output.artifacts,
                        })),
                    );
                    report.executed.push(StageRecord {
                        id: spec.id,
                        name: spec.name.clone(),
                        duration_ms,
                        artifacts: output.artifacts,
                    });
                }
                Err(cause) => {
                    error!(
                        stage_id = spec.id,
                        stage = %spec.name,
                        duration_ms,
                        error = %cause,
                        "Stage failed"
                    );
                    self.events.try_emit(
                        "stage.failed",
                        Some(json!({
                            "stage_id": spec.id,
                            "stage": spec.name,
                            "duration_ms": duration_ms,
                            "error": cause.to_dict(),
                        })),
                    );
                    self.events.try_emit(
                        "pipeline.failed",
                        Some(json!({"pipeline": self.pipeline.name(), "stage_id": spec.id})),
                    );

                    self.state = RunState::Failed {
                        stage_id: spec.id,
                        cause: cause.to_string(),
                    };
                    report.state = self.state.clone();
                    self.report = Some(report);
                    return Err(ShardflowError::stage_failed(spec.id, spec.name, cause));
                }
            }
        }

        self.state = RunState::Succeeded;
        report.state = RunState::Succeeded;
        info!(
            pipeline = %self.pipeline.name(),
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "Pipeline completed"
        );
        self.events.try_emit(
            "pipeline.completed",
            Some(json!({
                "pipeline": self.pipeline.name(),
                "executed": report.executed_ids(),
                "skipped": report.skipped,
            })),
        );

        self.report = Some(report.clone());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageRange;
    use crate::pipeline::PipelineBuilder;
    use crate::testing::{FailingStage, MisconfiguredStage, MockBackend, RecordingStage};
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;

    struct Fixture {
        stages: Vec<Arc<RecordingStage>>,
        pipeline: Pipeline,
    }

    fn four_stages() -> Fixture {
        let stages: Vec<Arc<RecordingStage>> = ["prep", "feats", "lm", "decode"]
            .into_iter()
            .map(|n| Arc::new(RecordingStage::new(n)))
            .collect();
        let mut builder = PipelineBuilder::new("asr");
        for (i, stage) in stages.iter().enumerate() {
            builder = builder.stage(u32::try_from(i).unwrap() + 1, stage.clone()).unwrap();
        }
        Fixture {
            stages,
            pipeline: builder.build(),
        }
    }

    fn runner(pipeline: Pipeline, config: RunConfig) -> StageRunner {
        let dispatcher = Arc::new(JobDispatcher::new(Arc::new(MockBackend::new())));
        StageRunner::new(pipeline, Arc::new(config), dispatcher)
    }

    fn calls(fixture: &Fixture) -> Vec<usize> {
        fixture.stages.iter().map(|s| s.call_count()).collect()
    }

    #[tokio::test]
    async fn test_runs_all_stages_in_order() {
        let fixture = four_stages();
        let events = Arc::new(CollectingEventSink::new());
        let mut runner = runner(fixture.pipeline.clone(), RunConfig::default()).with_events(events.clone());

        let report = runner.run().await.unwrap();

        assert_eq!(report.executed_ids(), vec![1, 2, 3, 4]);
        assert_eq!(calls(&fixture), vec![1, 1, 1, 1]);
        assert_eq!(runner.state(), &RunState::Succeeded);
        assert_eq!(events.event_types().first().map(String::as_str), Some("pipeline.started"));
        assert_eq!(events.event_types().last().map(String::as_str), Some("pipeline.completed"));
        assert_eq!(events.of_type("stage.completed").len(), 4);
    }

    #[tokio::test]
    async fn test_range_gating_runs_only_selected_stage() {
        let fixture = four_stages();
        let config = RunConfig::default().with_stage_range(StageRange::only(2));
        let mut runner = runner(fixture.pipeline.clone(), config);

        let report = runner.run().await.unwrap();

        assert_eq!(report.executed_ids(), vec![2]);
        assert_eq!(calls(&fixture), vec![0, 1, 0, 0]);
        assert_eq!(report.range, Some((2, 2)));
    }

    #[tokio::test]
    async fn test_out_of_range_values_are_clamped() {
        let fixture = four_stages();
        let config = RunConfig::default().with_stage_range(StageRange::new(0, 10_000));
        let report = runner(fixture.pipeline.clone(), config).run().await.unwrap();
        assert_eq!(report.range, Some((1, 4)));
        assert_eq!(report.executed_ids(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_empty_selection_succeeds() {
        let fixture = four_stages();
        let config = RunConfig::default().with_stage_range(StageRange::new(3, 2));
        let mut runner = runner(fixture.pipeline.clone(), config);

        let report = runner.run().await.unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(runner.state(), &RunState::Succeeded);
        assert_eq!(calls(&fixture), vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_skip_stages() {
        let fixture = four_stages();
        let config = RunConfig::default().with_skip_stage(1).with_skip_stage(3);
        let mut runner = runner(fixture.pipeline.clone(), config);
        assert_eq!(runner.active_stage_ids(), vec![2, 4]);

        let report = runner.run().await.unwrap();
        assert_eq!(report.executed_ids(), vec![2, 4]);
        assert_eq!(report.skipped, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fail_fast() {
        let first = Arc::new(RecordingStage::new("prep"));
        let last = Arc::new(RecordingStage::new("decode"));
        let pipeline = PipelineBuilder::new("asr")
            .stage(1, first.clone())
            .unwrap()
            .stage(2, Arc::new(FailingStage::new("train", "diverged")))
            .unwrap()
            .stage(3, last.clone())
            .unwrap()
            .build();
        let events = Arc::new(CollectingEventSink::new());
        let mut runner = runner(pipeline, RunConfig::default()).with_events(events.clone());

        let err = runner.run().await.unwrap_err();

        assert!(matches!(err, ShardflowError::StageFailed { stage_id: 2, .. }));
        assert_eq!(err.exit_code(), crate::errors::EXIT_FATAL);
        assert_eq!(first.call_count(), 1);
        assert_eq!(last.call_count(), 0);
        assert!(matches!(runner.state(), RunState::Failed { stage_id: 2, .. }));

        let report = runner.report().unwrap();
        assert_eq!(report.executed_ids(), vec![1]);
        assert_eq!(events.event_types().last().map(String::as_str), Some("pipeline.failed"));
    }

    #[tokio::test]
    async fn test_preflight_failure_in_later_stage_runs_nothing() {
        let first = Arc::new(RecordingStage::new("prep"));
        let pipeline = PipelineBuilder::new("asr")
            .stage(1, first.clone())
            .unwrap()
            .stage(2, Arc::new(MisconfiguredStage::new("lm")))
            .unwrap()
            .build();
        let events = Arc::new(CollectingEventSink::new());
        let mut rejected = runner(pipeline.clone(), RunConfig::default()).with_events(events.clone());

        let err = rejected.run().await.unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(err.exit_code(), crate::errors::EXIT_INVALID_INVOCATION);
        assert_eq!(first.call_count(), 0);
        assert_eq!(rejected.state(), &RunState::NotStarted);
        assert!(events.is_empty());

        let only_first = RunConfig::default().with_stage_range(StageRange::only(1));
        let report = runner(pipeline, only_first).run().await.unwrap();
        assert_eq!(report.executed_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_config_runs_nothing() {
        let fixture = four_stages();
        let mut runner = runner(fixture.pipeline.clone(), RunConfig::default().with_parallelism(0));

        let err = runner.run().await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(calls(&fixture), vec![0, 0, 0, 0]);
        assert_eq!(runner.state(), &RunState::NotStarted);
    }
}
