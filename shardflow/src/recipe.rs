//! Declarative pipelines.
//!
//! A recipe is a JSON file listing numbered stages. Each stage runs one
//! command, either once or once per shard of a manifest, and may merge the
//! shard outputs into an artifact directory:
//!
//! ```json
//! {
//!   "name": "asr",
//!   "exp_root": "exp",
//!   "stages": [
//!     {
//!       "id": 11,
//!       "name": "decode",
//!       "kind": "sharded",
//!       "manifest": "data/test/wav.scp",
//!       "command": ["decode.sh", "--keys", "{keys}", "--out", "{outdir}"],
//!       "aggregate": {"mode": "stream", "file": "text"},
//!       "tag": {"component": "decode", "base": "decode", "args": ["--beam 20"]}
//!     }
//!   ]
//! }
//! ```

use crate::aggregate::{Aggregator, MergeMode};
use crate::backend::{BackendAdapter, BackendKind, CommandSpec, ResourceRequest};
use crate::config::{RunConfig, StageOverride};
use crate::core::ArtifactDirectory;
use crate::dispatch::StageTask;
use crate::errors::{ConfigurationError, ShardflowError, ShardflowResult};
use crate::manifest::{SplitStrategy, WorkManifest};
use crate::pipeline::{Pipeline, PipelineBuilder, StageContext, StageOutput, StageSpec};
use crate::stages::Stage;
use crate::tag::{self, TagFlag, TagInputs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A pipeline definition loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Pipeline name.
    pub name: String,

    /// Artifact root; overrides the default, overridden by the CLI.
    #[serde(default)]
    pub exp_root: Option<PathBuf>,

    /// Default shard count cap.
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Execution backend.
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Option table file for queue backends.
    #[serde(default)]
    pub queue_conf: Option<PathBuf>,

    /// How manifests are split.
    #[serde(default)]
    pub split_strategy: Option<SplitStrategy>,

    /// Resources requested by every stage.
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Per-stage overrides keyed by stage name.
    #[serde(default)]
    pub stage_overrides: BTreeMap<String, StageOverride>,

    /// The stages.
    pub stages: Vec<RecipeStage>,
}

/// Whether a stage runs once or once per shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStageKind {
    /// A single job.
    #[default]
    Command,
    /// One job per shard of `manifest`.
    Sharded,
}

/// How a stage merges its shard outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Merge mode and its options.
    #[serde(flatten)]
    pub merge: MergeMode,

    /// Destination directory. Relative paths resolve against the stage's
    /// artifact directory, or the artifact root when no tag is declared.
    /// Defaults to the artifact directory itself, or `{exp_root}/{stage}`.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

/// How a stage names its artifact directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpec {
    /// Component kind, the first half of `{kind}_{tag}`.
    pub component: String,
    /// Fallback base name.
    #[serde(default)]
    pub base: Option<String>,
    /// Configuration file whose stem identifies the setup.
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Override arguments, appended to the command and folded into the tag.
    #[serde(default)]
    pub args: Vec<String>,
    /// Suffix flags.
    #[serde(default)]
    pub flags: Vec<TagFlag>,
    /// Explicit tag.
    #[serde(default)]
    pub explicit: Option<String>,
}

/// One stage of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStage {
    /// Stage id.
    pub id: u32,
    /// Stage name.
    pub name: String,
    /// Single job or sharded.
    #[serde(default)]
    pub kind: RecipeStageKind,
    /// Program and arguments. `JOB`, `{keys}`, `{outdir}` and `{artifact}`
    /// are expanded per job.
    pub command: Vec<String>,
    /// Items to shard, for sharded stages.
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    /// Merge step run after the barrier.
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
    /// Resources requested per job.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Artifact naming.
    #[serde(default)]
    pub tag: Option<TagSpec>,
}

impl Recipe {
    /// Parses and validates a recipe.
    pub fn parse(text: &str) -> ShardflowResult<Self> {
        let recipe: Self = serde_json::from_str(text)
            .map_err(|e| ConfigurationError::new(format!("invalid recipe: {e}")).with_key("recipe"))?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Reads a recipe file.
    pub fn load(path: impl AsRef<Path>) -> ShardflowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read recipe {}: {e}", path.display()))
                .with_key("recipe")
        })?;
        let recipe = Self::parse(&text)?;
        debug!(recipe = %recipe.name, stages = recipe.stages.len(), "Loaded recipe");
        Ok(recipe)
    }

    /// Checks stage shapes without touching the filesystem.
    pub fn validate(&self) -> ShardflowResult<()> {
        if self.stages.is_empty() {
            return Err(ConfigurationError::new(format!("recipe '{}' has no stages", self.name))
                .with_key("stages")
                .into());
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }

    /// Overlays the recipe's settings on `config`.
    #[must_use]
    pub fn apply_to(&self, mut config: RunConfig) -> RunConfig {
        if let Some(exp_root) = &self.exp_root {
            config.exp_root.clone_from(exp_root);
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(queue_conf) = &self.queue_conf {
            config.queue_conf = Some(queue_conf.clone());
        }
        if let Some(strategy) = self.split_strategy {
            config.split_strategy = strategy;
        }
        config.resources = config.resources.merged(&self.resources);
        for (stage, o) in &self.stage_overrides {
            config.stage_overrides.insert(stage.clone(), o.clone());
        }
        config
    }

    /// Builds the pipeline.
    pub fn into_pipeline(self) -> ShardflowResult<Pipeline> {
        let mut builder = PipelineBuilder::new(&self.name);
        for stage in self.stages {
            let id = stage.id;
            builder.add_stage_spec(StageSpec::new(id, Arc::new(stage)))?;
        }
        Ok(builder.build())
    }
}

impl RecipeStage {
    fn validate(&self) -> ShardflowResult<()> {
        let key = format!("stages.{}", self.id);
        if self.command.is_empty() {
            return Err(ConfigurationError::new(format!("stage '{}' has an empty command", self.name))
                .with_key(key)
                .into());
        }
        match (self.kind, &self.manifest) {
            (RecipeStageKind::Sharded, None) => {
                return Err(ConfigurationError::new(format!(
                    "sharded stage '{}' needs a manifest",
                    self.name
                ))
                .with_key(key)
                .into());
            }
            (RecipeStageKind::Command, Some(_)) => {
                return Err(ConfigurationError::new(format!(
                    "stage '{}' has a manifest but is not sharded",
                    self.name
                ))
                .with_key(key)
                .into());
            }
            _ => {}
        }
        if let Some(tag) = &self.tag {
            if tag.component.trim().is_empty() {
                return Err(ConfigurationError::new(format!(
                    "stage '{}' declares a tag without a component",
                    self.name
                ))
                .with_key(key)
                .into());
            }
        }
        Ok(())
    }

    fn tag_inputs(&self, spec: &TagSpec, extra_args: &[String]) -> TagInputs {
        let args: Vec<&str> = spec
            .args
            .iter()
            .chain(extra_args)
            .map(String::as_str)
            .collect();
        TagInputs {
            base_name: spec.base.clone().or_else(|| Some(self.name.clone())),
            config: spec.config.clone(),
            override_args: (!args.is_empty()).then(|| args.join(" ")),
            flags: spec.flags.clone(),
            explicit_tag: spec.explicit.clone(),
        }
    }
}

#[async_trait]
impl Stage for RecipeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self, config: &RunConfig, backend: &dyn BackendAdapter) -> ShardflowResult<()> {
        backend
            .validate_resources(&config.resources_for(&self.name, &self.resources))
            .map_err(|e| match e {
                ShardflowError::Configuration(inner) => ConfigurationError::new(format!(
                    "stage {} ({}): {}",
                    self.id, self.name, inner.message
                ))
                .with_key(format!("stages.{}.resources", self.id))
                .into(),
                other => other,
            })
    }

    async fn execute(&self, ctx: &StageContext) -> ShardflowResult<StageOutput> {
        let config = ctx.config();
        let extra_args = config.extra_args_for(&self.name);

        let artifact = self.tag.as_ref().map(|spec| {
            let tag = tag::resolve(&self.tag_inputs(spec, extra_args));
            let dir = ctx.artifact_dir(&spec.component, &tag);
            ArtifactDirectory::new(tag, dir).with_stage(ctx.stage_id())
        });

        let mut argv = self.command.clone();
        if let Some(spec) = &self.tag {
            argv.extend(spec.args.iter().flat_map(|a| a.split_whitespace().map(str::to_string)));
        }
        argv.extend(extra_args.iter().cloned());
        let mut command = CommandSpec::from_argv(argv)?;

        let work_dir = match &artifact {
            Some(dir) => {
                dir.ensure()?;
                command = command.expand_var("artifact", &dir.path().display().to_string());
                dir.path().to_path_buf()
            }
            None => config.exp_root.join(&self.name),
        };

        let mut task = StageTask::new(&self.name, command, work_dir.join("logdir"))
            .with_resources(config.resources_for(&self.name, &self.resources));
        if let Some(path) = &self.manifest {
            let manifest = WorkManifest::read(path)?;
            task = task
                .with_manifest(Arc::new(manifest))
                .with_parallelism(config.parallelism_for(&self.name));
        }

        let input = ctx.run_task(&task).await?;

        let mut output = StageOutput::ok();
        let tag_name = artifact
            .as_ref()
            .map_or_else(|| self.name.clone(), |dir| dir.tag.clone());

        if let Some(aggregate) = &self.aggregate {
            let dest = match (&aggregate.output, &artifact) {
                (Some(out), Some(dir)) => dir.join(out),
                (Some(out), None) => config.exp_root.join(out),
                (None, Some(dir)) => dir.path().to_path_buf(),
                (None, None) => config.exp_root.join(&self.name),
            };
            let merged = Aggregator::new(aggregate.merge.clone())
                .merge(&input, &dest, &tag_name)?
                .with_stage(ctx.stage_id());
            ctx.emit("stage.artifact", serde_json::json!({"path": merged.path}));
            output = output.with_artifact(merged);
        } else if let Some(dir) = artifact {
            output = output.with_artifact(dir);
        }

        info!(
            stage_id = ctx.stage_id(),
            stage = %self.name,
            shards = input.len(),
            artifacts = output.artifacts.len(),
            "Recipe stage finished"
        );
        Ok(output)
    }
}
