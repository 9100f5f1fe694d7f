//! Lifecycle event emission.
//!
//! The runner emits `pipeline.*` and `stage.*` events; the dispatcher emits
//! `shard.*` events. Sinks are passed explicitly; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Returns the sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(LoggingEventSink::debug())
}
