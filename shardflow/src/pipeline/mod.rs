//! Pipeline definition and execution.
//!
//! A pipeline is an ordered list of `(id, name, stage)` entries built with
//! [`PipelineBuilder`] and executed by [`StageRunner`]:
//!
//! ```rust,ignore
//! let pipeline = PipelineBuilder::new("asr")
//!     .stage(1, Arc::new(DataPrep))?
//!     .stage(2, Arc::new(FeatureExtraction))?
//!     .build();
//!
//! let mut runner = StageRunner::new(pipeline, Arc::new(config), dispatcher);
//! let report = runner.run().await?;
//! ```

mod builder;
mod context;
mod integration_tests;
mod runner;
mod spec;

pub use crate::stages::{FnStage, Stage, StageOutput};
pub use builder::{Pipeline, PipelineBuilder};
pub use context::StageContext;
pub use runner::{RunReport, StageRecord, StageRunner};
pub use spec::StageSpec;
