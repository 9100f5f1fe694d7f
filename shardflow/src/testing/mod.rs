//! Testing utilities for shardflow pipelines.
//!
//! This module provides:
//! - A scripted in-process backend
//! - Recording and failing stages
//! - Stage context fixtures

mod fixtures;
mod mocks;

pub use fixtures::{context_with, test_context};
pub use mocks::{
    FailingStage, JobFn, MisconfiguredStage, MockBackend, RecordedBatch, RecordingStage,
};
