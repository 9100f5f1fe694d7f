//! Run configuration.
//!
//! A [`RunConfig`] is resolved once per invocation (defaults, then the recipe
//! file, then command-line flags) and is read-only while the pipeline runs.

use crate::backend::{BackendKind, ResourceRequest};
use crate::errors::{ConfigurationError, ShardflowResult};
use crate::manifest::SplitStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Default maximum number of shards per task.
pub const DEFAULT_PARALLELISM: usize = 32;

/// Default queue poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Inclusive stage-id selection. Missing bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRange {
    /// First stage to run.
    #[serde(default)]
    pub start: Option<u32>,
    /// Last stage to run.
    #[serde(default)]
    pub stop: Option<u32>,
}

impl StageRange {
    /// Selects every stage.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects `start..=stop`.
    #[must_use]
    pub fn new(start: u32, stop: u32) -> Self {
        Self {
            start: Some(start),
            stop: Some(stop),
        }
    }

    /// Selects a single stage.
    #[must_use]
    pub fn only(id: u32) -> Self {
        Self::new(id, id)
    }

    /// Clamps the range to the pipeline's bounds.
    ///
    /// Returns `None` when nothing is selected.
    #[must_use]
    pub fn clamp(&self, min: u32, max: u32) -> Option<RangeInclusive<u32>> {
        let start = self.start.unwrap_or(min).clamp(min, max);
        let stop = self.stop.unwrap_or(max).clamp(min, max);
        let empty = self.start.is_some_and(|s| s > max)
            || self.stop.is_some_and(|s| s < min)
            || start > stop;
        (!empty).then_some(start..=stop)
    }

    /// Returns true if `id` is selected.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.start.map_or(true, |s| id >= s) && self.stop.map_or(true, |s| id <= s)
    }
}

/// Per-stage settings that override the run-wide ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOverride {
    /// Shard count cap for this stage.
    #[serde(default)]
    pub parallelism: Option<usize>,
    /// Resources laid over the stage's own request.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Extra arguments appended to the stage's command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Which stages run.
    #[serde(default)]
    pub stage_range: StageRange,

    /// Stage ids skipped even when in range.
    #[serde(default)]
    pub skip_stages: BTreeSet<u32>,

    /// Default shard count cap.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Execution backend.
    #[serde(default)]
    pub backend: BackendKind,

    /// Option table file replacing the backend's built-in table.
    #[serde(default)]
    pub queue_conf: Option<PathBuf>,

    /// Root of all artifact directories.
    #[serde(default = "default_exp_root")]
    pub exp_root: PathBuf,

    /// How manifests are split.
    #[serde(default)]
    pub split_strategy: SplitStrategy,

    /// Queue poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Queue jobs still unfinished after this long are failed.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,

    /// Resources requested by every stage.
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Overrides keyed by stage name.
    #[serde(default)]
    pub stage_overrides: BTreeMap<String, StageOverride>,
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_exp_root() -> PathBuf {
    PathBuf::from("exp")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stage_range: StageRange::default(),
            skip_stages: BTreeSet::new(),
            parallelism: DEFAULT_PARALLELISM,
            backend: BackendKind::default(),
            queue_conf: None,
            exp_root: default_exp_root(),
            split_strategy: SplitStrategy::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            job_timeout_secs: None,
            resources: ResourceRequest::default(),
            stage_overrides: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Sets the stage range.
    #[must_use]
    pub fn with_stage_range(mut self, range: StageRange) -> Self {
        self.stage_range = range;
        self
    }

    /// Skips a stage.
    #[must_use]
    pub fn with_skip_stage(mut self, id: u32) -> Self {
        self.skip_stages.insert(id);
        self
    }

    /// Sets the default parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the option table file.
    #[must_use]
    pub fn with_queue_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_conf = Some(path.into());
        self
    }

    /// Sets the artifact root.
    #[must_use]
    pub fn with_exp_root(mut self, exp_root: impl Into<PathBuf>) -> Self {
        self.exp_root = exp_root.into();
        self
    }

    /// Sets the split strategy.
    #[must_use]
    pub fn with_split_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.split_strategy = strategy;
        self
    }

    /// Sets the queue poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the queue job timeout.
    #[must_use]
    pub fn with_job_timeout_secs(mut self, secs: u64) -> Self {
        self.job_timeout_secs = Some(secs);
        self
    }

    /// Sets the run-wide resources.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Adds an override for the named stage.
    #[must_use]
    pub fn with_stage_override(mut self, stage: impl Into<String>, o: StageOverride) -> Self {
        self.stage_overrides.insert(stage.into(), o);
        self
    }

    /// Returns true if stage `id` is selected by range and skip list.
    #[must_use]
    pub fn is_active(&self, id: u32) -> bool {
        self.stage_range.contains(id) && !self.skip_stages.contains(&id)
    }

    /// Parallelism for the named stage.
    #[must_use]
    pub fn parallelism_for(&self, stage: &str) -> usize {
        self.stage_overrides
            .get(stage)
            .and_then(|o| o.parallelism)
            .unwrap_or(self.parallelism)
    }

    /// Resources for the named stage: run-wide, then the stage's own, then
    /// the configured override.
    #[must_use]
    pub fn resources_for(&self, stage: &str, own: &ResourceRequest) -> ResourceRequest {
        let merged = self.resources.merged(own);
        match self.stage_overrides.get(stage) {
            Some(o) => merged.merged(&o.resources),
            None => merged,
        }
    }

    /// Extra arguments configured for the named stage.
    #[must_use]
    pub fn extra_args_for(&self, stage: &str) -> &[String] {
        self.stage_overrides
            .get(stage)
            .map(|o| o.args.as_slice())
            .unwrap_or_default()
    }

    /// Checks the configuration before any stage runs.
    pub fn validate(&self) -> ShardflowResult<()> {
        if self.parallelism == 0 {
            return Err(ConfigurationError::new("parallelism must be at least 1")
                .with_key("parallelism")
                .into());
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigurationError::new("poll interval must be positive")
                .with_key("poll_interval_ms")
                .into());
        }
        if self.exp_root.as_os_str().is_empty() {
            return Err(ConfigurationError::new("exp_root must not be empty")
                .with_key("exp_root")
                .into());
        }
        for (stage, o) in &self.stage_overrides {
            if o.parallelism == Some(0) {
                return Err(ConfigurationError::new(format!(
                    "parallelism for stage '{stage}' must be at least 1"
                ))
                .with_key(format!("stage_overrides.{stage}.parallelism"))
                .into());
            }
            o.resources.max_jobs_run_value()?;
        }
        self.resources.max_jobs_run_value()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_clamp() {
        assert_eq!(StageRange::all().clamp(1, 13), Some(1..=13));
        assert_eq!(StageRange::new(0, 10_000).clamp(1, 13), Some(1..=13));
        assert_eq!(StageRange::only(2).clamp(1, 4), Some(2..=2));
        assert_eq!(StageRange::new(5, 3).clamp(1, 13), None);
        assert_eq!(StageRange::new(20, 30).clamp(1, 13), None);
    }

    #[test]
    fn test_range_contains() {
        let range = StageRange::new(2, 3);
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(3));
        assert!(!range.contains(4));
        assert!(StageRange::all().contains(u32::MAX));
    }

    #[test]
    fn test_is_active_with_skip() {
        let config = RunConfig::default()
            .with_stage_range(StageRange::new(1, 5))
            .with_skip_stage(3);
        assert!(config.is_active(2));
        assert!(!config.is_active(3));
        assert!(!config.is_active(6));
    }

    #[test]
    fn test_overrides() {
        let config = RunConfig::default()
            .with_parallelism(8)
            .with_resources(ResourceRequest::new().gpu(0))
            .with_stage_override(
                "decode",
                StageOverride {
                    parallelism: Some(2),
                    resources: ResourceRequest::new().gpu(1),
                    args: vec!["--beam".into(), "20".into()],
                },
            );

        assert_eq!(config.parallelism_for("decode"), 2);
        assert_eq!(config.parallelism_for("lm"), 8);

        let own = ResourceRequest::new().mem("4G");
        let decode = config.resources_for("decode", &own);
        assert_eq!(decode.get("gpu"), Some("1"));
        assert_eq!(decode.get("mem"), Some("4G"));
        assert_eq!(config.resources_for("lm", &own).get("gpu"), Some("0"));
        assert_eq!(config.extra_args_for("decode").len(), 2);
        assert!(config.extra_args_for("lm").is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(RunConfig::default().validate().is_ok());
        assert!(RunConfig::default().with_parallelism(0).validate().unwrap_err().is_configuration());
        assert!(RunConfig::default().with_poll_interval_ms(0).validate().is_err());

        let bad_override = RunConfig::default().with_stage_override(
            "x",
            StageOverride {
                parallelism: Some(0),
                ..StageOverride::default()
            },
        );
        assert!(bad_override.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"stage_range": {"start": 3}, "backend": "slurm", "skip_stages": [5]}"#,
        )
        .unwrap();

        assert_eq!(config.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.backend, BackendKind::Slurm);
        assert_eq!(config.stage_range.start, Some(3));
        assert_eq!(config.stage_range.stop, None);
        assert!(config.skip_stages.contains(&5));
        assert_eq!(config.exp_root, PathBuf::from("exp"));
    }
}
