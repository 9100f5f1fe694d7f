//! Event sink trait and implementations.

use crate::core::StageEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives lifecycle events from the runner and the dispatcher.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event without blocking. Never fails.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "stage.started")
    /// * `data` - Optional event data
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event asynchronously.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        let data = data.map(|d| d.to_string()).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = %data, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = %data, "Event: {}", event_type);
        }
    }
}

/// A sink that keeps every event, for inspection in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<StageEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Returns the events of one type.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events
            .write()
            .push(StageEvent::from_payload(event_type, data));
    }
}
