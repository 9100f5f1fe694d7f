//! Pipeline builder with validation.

use super::StageSpec;
use crate::errors::{ConfigurationError, ShardflowResult};
use crate::stages::Stage;
use std::sync::Arc;

/// A validated, ordered list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<StageSpec>,
}

impl Pipeline {
    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in increasing id order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Smallest and largest stage id, if any stage exists.
    #[must_use]
    pub fn bounds(&self) -> Option<(u32, u32)> {
        Some((self.stages.first()?.id, self.stages.last()?.id))
    }

    /// Returns the stage with the given id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage with the given id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already taken or the stage is invalid.
    pub fn stage(mut self, id: u32, runner: Arc<dyn Stage>) -> ShardflowResult<Self> {
        self.add_stage_spec(StageSpec::new(id, runner))?;
        Ok(self)
    }

    /// Adds a stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already taken or the stage is invalid.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> ShardflowResult<()> {
        spec.validate()?;

        if let Some(existing) = self.stages.iter().find(|s| s.id == spec.id) {
            return Err(ConfigurationError::new(format!(
                "stage id {} is used by both '{}' and '{}'",
                spec.id, existing.name, spec.name
            ))
            .with_key("stages")
            .into());
        }

        self.stages.push(spec);
        Ok(())
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Builds the pipeline, ordering stages by id.
    #[must_use]
    pub fn build(mut self) -> Pipeline {
        self.stages.sort_by_key(|s| s.id);
        Pipeline {
            name: self.name,
            stages: self.stages,
        }
    }
}
