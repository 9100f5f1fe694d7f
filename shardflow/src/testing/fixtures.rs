//! Context fixtures.

use crate::config::RunConfig;
use crate::dispatch::JobDispatcher;
use crate::events::{CollectingEventSink, EventSink};
use crate::pipeline::StageContext;
use std::sync::Arc;
use uuid::Uuid;

use super::MockBackend;

/// A context backed by a default [`MockBackend`] and default configuration.
#[must_use]
pub fn test_context(stage_id: u32, stage_name: &str) -> StageContext {
    context_with(
        stage_id,
        stage_name,
        RunConfig::default(),
        Arc::new(MockBackend::new()),
        Arc::new(CollectingEventSink::new()),
    )
}

/// A context over the given configuration, backend and sink.
#[must_use]
pub fn context_with(
    stage_id: u32,
    stage_name: &str,
    config: RunConfig,
    backend: Arc<MockBackend>,
    events: Arc<dyn EventSink>,
) -> StageContext {
    let dispatcher = JobDispatcher::new(backend)
        .with_events(Arc::clone(&events))
        .with_split_strategy(config.split_strategy);
    StageContext::new(
        stage_id,
        stage_name,
        Uuid::new_v4(),
        Arc::new(config),
        Arc::new(dispatcher),
        events,
    )
}
