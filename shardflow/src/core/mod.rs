//! Core domain model types for shardflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Job and run status enums
//! - Artifact directory handles
//! - Lifecycle events

mod artifact;
mod event;
mod status;

pub use artifact::ArtifactDirectory;
pub use event::StageEvent;
pub use status::{JobStatus, RunState};

/// Returns the current UTC time as an RFC 3339 string.
#[must_use]
pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
