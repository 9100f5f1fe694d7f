//! # Shardflow
//!
//! Staged batch pipelines whose heavy stages fan out over a work manifest.
//!
//! A pipeline is an ordered list of numbered stages. A run selects a
//! contiguous id range, executes the selected stages one after another and
//! stops at the first failure. Inside a stage, a [`StageTask`] is split into
//! shards, one backend job per shard, joined by a barrier that succeeds only
//! if every shard did. The shard outputs are then merged into one
//! [`ArtifactDirectory`] whose name is derived from the configuration that
//! produced it.
//!
//! - **Sharding**: contiguous, order-preserving manifest splits
//! - **Backends**: local processes or a batch scheduler (Grid Engine, Slurm)
//!   driven by a declarative option table
//! - **Aggregation**: stream merges sorted by item id and summed stat dirs
//! - **Tags**: deterministic artifact names from config and overrides
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shardflow::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("asr")
//!     .stage(1, Arc::new(PrepareData::new()))?
//!     .stage(11, Arc::new(Decode::new()))?
//!     .build();
//!
//! let config = Arc::new(RunConfig::default().with_stage_range(StageRange::new(11, 13)));
//! let dispatcher = Arc::new(JobDispatcher::new(create_backend(&config)?));
//! let report = StageRunner::new(pipeline, config, dispatcher).run().await?;
//! ```
//!
//! [`StageTask`]: dispatch::StageTask
//! [`ArtifactDirectory`]: core::ArtifactDirectory

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod aggregate;
pub mod backend;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod recipe;
pub mod stages;
pub mod tag;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::aggregate::{Aggregator, MergeMode};
    pub use crate::backend::{
        create_backend, BackendAdapter, BackendKind, CommandSpec, JobBatch, JobResult,
        LocalBackend, OptionTable, QueueBackend, ResourceRequest,
    };
    pub use crate::config::{RunConfig, StageOverride, StageRange};
    pub use crate::core::{ArtifactDirectory, JobStatus, RunState, StageEvent};
    pub use crate::dispatch::{AggregationInput, JobDispatcher, ShardOutput, StageTask};
    pub use crate::errors::{ShardflowError, ShardflowResult};
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::manifest::{split, split_with, Shard, SplitStrategy, WorkManifest};
    pub use crate::pipeline::{
        FnStage, Pipeline, PipelineBuilder, RunReport, Stage, StageContext, StageOutput,
        StageRunner, StageSpec,
    };
    pub use crate::recipe::Recipe;
    pub use crate::tag::{TagInputs, TagResolver};
}
