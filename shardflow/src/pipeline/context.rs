//! Per-stage execution context.

use crate::config::RunConfig;
use crate::dispatch::{AggregationInput, JobDispatcher, StageTask};
use crate::errors::ShardflowResult;
use crate::events::EventSink;
use crate::tag;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// What a stage sees while it runs.
///
/// Cloning is cheap: the configuration, dispatcher and sink are shared.
#[derive(Clone)]
pub struct StageContext {
    stage_id: u32,
    stage_name: String,
    run_id: Uuid,
    config: Arc<RunConfig>,
    dispatcher: Arc<JobDispatcher>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage_id", &self.stage_id)
            .field("stage_name", &self.stage_name)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Creates a context for one stage of a run.
    #[must_use]
    pub fn new(
        stage_id: u32,
        stage_name: impl Into<String>,
        run_id: Uuid,
        config: Arc<RunConfig>,
        dispatcher: Arc<JobDispatcher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            stage_id,
            stage_name: stage_name.into(),
            run_id,
            config,
            dispatcher,
            events,
        }
    }

    /// The running stage's id.
    #[must_use]
    pub fn stage_id(&self) -> u32 {
        self.stage_id
    }

    /// The running stage's name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Identifier of the whole run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The job dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Emits an event tagged with this stage's id and name.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        let mut payload = json!({"stage_id": self.stage_id, "stage": self.stage_name});
        if let (Some(target), serde_json::Value::Object(extra)) = (payload.as_object_mut(), data) {
            target.extend(extra);
        }
        self.events.try_emit(event_type, Some(payload));
    }

    /// Runs a task through the dispatcher and waits for the barrier.
    pub async fn run_task(&self, task: &StageTask) -> ShardflowResult<AggregationInput> {
        self.dispatcher.run_stage_task(task).await
    }

    /// `{exp_root}/{kind}_{tag}` under this run's artifact root.
    #[must_use]
    pub fn artifact_dir(&self, kind: &str, tag: &str) -> PathBuf {
        tag::artifact_dir(&self.config.exp_root, kind, tag)
    }
}
