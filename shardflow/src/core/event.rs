//! Lifecycle event type emitted by the runner and the dispatcher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event emitted during a pipeline run.
///
/// Events are consumed by [`EventSink`](crate::events::EventSink)s for
/// logging or inspection in tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "shard.failed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (RFC 3339).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: super::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Creates an event from a type and an optional JSON object payload.
    ///
    /// Non-object payloads are stored under the `value` key.
    #[must_use]
    pub fn from_payload(event_type: &str, payload: Option<serde_json::Value>) -> Self {
        let event = Self::new(event_type);
        match payload {
            Some(serde_json::Value::Object(map)) => {
                map.into_iter().fold(event, |event, (k, v)| event.add_data(k, v))
            }
            Some(other) => event.add_data("value", other),
            None => event,
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns a payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}
