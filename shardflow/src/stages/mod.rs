//! Stage trait and implementations.
//!
//! A stage is one numbered step of a pipeline. Its body is opaque to the
//! runner; stages communicate only through artifact directories on disk.

use crate::backend::BackendAdapter;
use crate::config::RunConfig;
use crate::core::ArtifactDirectory;
use crate::errors::ShardflowResult;
use crate::pipeline::StageContext;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Checks the stage against the run configuration and backend. Runs for
    /// every selected stage before the first one executes.
    ///
    /// # Errors
    ///
    /// Any error aborts the run before a stage has started.
    fn preflight(&self, _config: &RunConfig, _backend: &dyn BackendAdapter) -> ShardflowResult<()> {
        Ok(())
    }

    /// Executes the stage.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The stage execution context
    ///
    /// # Errors
    ///
    /// Any error fails the stage, and with it the pipeline.
    async fn execute(&self, ctx: &StageContext) -> ShardflowResult<StageOutput>;
}

/// What a successful stage produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    /// Artifact directories written by the stage.
    pub artifacts: Vec<ArtifactDirectory>,
}

impl StageOutput {
    /// An output with no artifacts.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ArtifactDirectory) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// A stage backed by an async closure.
pub struct FnStage<F, Fut> {
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = ShardflowResult<StageOutput>> + Send,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnStage<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = ShardflowResult<StageOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> ShardflowResult<StageOutput> {
        (self.func)(ctx.clone()).await
    }
}
