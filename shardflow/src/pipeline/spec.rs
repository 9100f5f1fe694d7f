//! Stage specifications.

use crate::errors::{ConfigurationError, ShardflowResult};
use crate::stages::Stage;
use std::sync::Arc;

/// One numbered stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Numeric id; stages run in increasing id order.
    pub id: u32,
    /// Stage name, used in logs and events.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
}

impl StageSpec {
    /// Creates a spec named after the stage.
    #[must_use]
    pub fn new(id: u32, runner: Arc<dyn Stage>) -> Self {
        Self {
            id,
            name: runner.name().to_string(),
            runner,
        }
    }

    /// Overrides the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn validate(&self) -> ShardflowResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::new(format!("stage {} has an empty name", self.id))
                .with_key("stages")
                .into());
        }
        Ok(())
    }
}
