//! Command-line interface.
//!
//! ```text
//! shardflow run   --recipe asr.json --stage 10 --stop-stage 13 --nj 32
//! shardflow split --manifest data/test/wav.scp --nj 8 --out-dir split8
//! shardflow tag   --base train --config conf/train.yaml --args "--lr 0.1"
//! shardflow merge --mode stream --out text output.*/text
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::aggregate::{check_coverage, merge_stats, merge_stream};
use crate::backend::{create_backend, BackendKind};
use crate::config::{RunConfig, StageRange};
use crate::dispatch::JobDispatcher;
use crate::errors::{ConfigurationError, ShardflowResult};
use crate::events::default_sink;
use crate::manifest::{split_with, SplitStrategy, WorkManifest};
use crate::pipeline::{RunReport, StageRunner};
use crate::recipe::Recipe;
use crate::tag::{self, TagFlag, TagInputs};

#[derive(Debug, Parser)]
#[command(name = "shardflow", version)]
#[command(about = "Staged batch pipelines with sharded job dispatch")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the stages of a recipe
    Run(RunArgs),
    /// Write shard key files for a manifest
    Split(SplitArgs),
    /// Print the tag for a configuration
    Tag(TagArgs),
    /// Merge shard outputs
    Merge(MergeArgs),
}

impl Command {
    /// Subcommand name, for error context.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Split(_) => "split",
            Self::Tag(_) => "tag",
            Self::Merge(_) => "merge",
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Recipe file (JSON)
    #[arg(long)]
    pub recipe: PathBuf,

    /// First stage to run
    #[arg(long)]
    pub stage: Option<u32>,

    /// Last stage to run
    #[arg(long)]
    pub stop_stage: Option<u32>,

    /// Stages to skip (repeatable)
    #[arg(long = "skip-stage")]
    pub skip_stages: Vec<u32>,

    /// Maximum number of parallel shards
    #[arg(long)]
    pub nj: Option<usize>,

    /// Execution backend: local, grid-engine or slurm
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Option table replacing the backend's built-in one
    #[arg(long)]
    pub queue_conf: Option<PathBuf>,

    /// Root of artifact directories
    #[arg(long)]
    pub exp_root: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Overlays the flags on `config`; flags win over everything else.
    #[must_use]
    pub fn apply_to(&self, mut config: RunConfig) -> RunConfig {
        if self.stage.is_some() || self.stop_stage.is_some() {
            config.stage_range = StageRange {
                start: self.stage,
                stop: self.stop_stage,
            };
        }
        config.skip_stages.extend(self.skip_stages.iter().copied());
        if let Some(nj) = self.nj {
            config.parallelism = nj;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(queue_conf) = &self.queue_conf {
            config.queue_conf = Some(queue_conf.clone());
        }
        if let Some(exp_root) = &self.exp_root {
            config.exp_root.clone_from(exp_root);
        }
        config
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum StrategyArg {
    #[default]
    Contiguous,
    Balanced,
}

impl From<StrategyArg> for SplitStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Contiguous => Self::Contiguous,
            StrategyArg::Balanced => Self::Balanced,
        }
    }
}

#[derive(Debug, Args)]
pub struct SplitArgs {
    /// Manifest to split
    #[arg(long)]
    pub manifest: PathBuf,

    /// Maximum number of shards
    #[arg(long)]
    pub nj: usize,

    /// Directory receiving keys.<i>.scp
    #[arg(long)]
    pub out_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = StrategyArg::Contiguous)]
    pub strategy: StrategyArg,
}

#[derive(Debug, Args)]
pub struct TagArgs {
    /// Base name used when no config is given
    #[arg(long, default_value = tag::DEFAULT_BASE_NAME)]
    pub base: String,

    /// Configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override arguments, as one string
    #[arg(long, allow_hyphen_values = true)]
    pub args: Option<String>,

    /// Suffix flag as name=suffix (repeatable)
    #[arg(long = "flag", value_parser = parse_flag)]
    pub flags: Vec<TagFlag>,

    /// Use this tag as is
    #[arg(long)]
    pub explicit: Option<String>,

    /// Print `{exp_root}/{kind}_{tag}` instead of the tag
    #[arg(long)]
    pub kind: Option<String>,

    #[arg(long, default_value = "exp")]
    pub exp_root: PathBuf,
}

impl TagArgs {
    fn inputs(&self) -> TagInputs {
        TagInputs {
            base_name: Some(self.base.clone()),
            config: self.config.clone(),
            override_args: self.args.clone(),
            flags: self.flags.clone(),
            explicit_tag: self.explicit.clone(),
        }
    }
}

fn parse_flag(s: &str) -> Result<TagFlag, String> {
    let (name, suffix) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=suffix, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("flag name missing in '{s}'"));
    }
    Ok(TagFlag::new(name, true, suffix))
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MergeModeArg {
    /// Line records sorted by item id; inputs are files
    Stream,
    /// Stat directories; inputs are directories
    Stats,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    #[arg(long, value_enum)]
    pub mode: MergeModeArg,

    /// Output file (stream) or directory (stats)
    #[arg(long)]
    pub out: PathBuf,

    /// Manifest every item of which must appear exactly once (stream only)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Shard outputs, in shard order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

/// Runs a parsed command.
pub async fn execute(cli: Cli) -> ShardflowResult<()> {
    match cli.command {
        Command::Run(args) => {
            let report = run(&args).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for stage in &report.executed {
                    println!("{}\t{}\t{}ms", stage.id, stage.name, stage.duration_ms);
                }
            }
            Ok(())
        }
        Command::Split(args) => split(&args),
        Command::Tag(args) => {
            let resolved = tag::resolve(&args.inputs());
            match &args.kind {
                Some(kind) => println!("{}", tag::artifact_dir(&args.exp_root, kind, &resolved).display()),
                None => println!("{resolved}"),
            }
            Ok(())
        }
        Command::Merge(args) => merge(&args),
    }
}

/// Loads a recipe, resolves the configuration and runs the selected stages.
pub async fn run(args: &RunArgs) -> ShardflowResult<RunReport> {
    let recipe = Recipe::load(&args.recipe)?;
    let config = args.apply_to(recipe.apply_to(RunConfig::default()));
    config.validate()?;

    let events = default_sink();
    let dispatcher = JobDispatcher::new(create_backend(&config)?)
        .with_events(Arc::clone(&events))
        .with_split_strategy(config.split_strategy);

    let mut runner = StageRunner::new(
        recipe.into_pipeline()?,
        Arc::new(config),
        Arc::new(dispatcher),
    )
    .with_events(events);
    runner.run().await
}

fn split(args: &SplitArgs) -> ShardflowResult<()> {
    let manifest = WorkManifest::read(&args.manifest)?;
    for shard in split_with(&manifest, args.nj, args.strategy.into())? {
        let path = shard.write_key_file(&args.out_dir)?;
        println!("{}", path.display());
    }
    Ok(())
}

fn merge(args: &MergeArgs) -> ShardflowResult<()> {
    let sources: Vec<(usize, PathBuf)> = args
        .inputs
        .iter()
        .enumerate()
        .map(|(i, path)| (i + 1, path.clone()))
        .collect();

    match args.mode {
        MergeModeArg::Stream => {
            let merged = merge_stream(&sources)?;
            if let Some(path) = &args.manifest {
                check_coverage(&merged, &WorkManifest::read(path)?)?;
            }
            if let Some(parent) = args.out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&args.out, merged)?;
        }
        MergeModeArg::Stats => {
            if args.manifest.is_some() {
                return Err(ConfigurationError::new("--manifest applies to stream merges only")
                    .with_key("manifest")
                    .into());
            }
            merge_stats(&sources, &args.out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "shardflow", "run", "--recipe", "asr.json", "--stage", "2", "--stop-stage", "5",
            "--skip-stage", "3", "--skip-stage", "4", "--nj", "8", "--backend", "slurm",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        let config = args.apply_to(RunConfig::default());
        assert_eq!(config.stage_range, StageRange::new(2, 5));
        assert_eq!(config.skip_stages.iter().copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.backend, BackendKind::Slurm);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["shardflow", "run", "--recipe", "r.json", "--backend", "pbs"]).is_err());
    }

    #[test]
    fn test_flags_override_recipe() {
        let recipe = Recipe::parse(
            r#"{"name": "x", "exp_root": "from_recipe", "parallelism": 4,
                "stages": [{"id": 1, "name": "a", "command": ["true"]}]}"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(["shardflow", "run", "--recipe", "r.json", "--nj", "2"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        let config = args.apply_to(recipe.apply_to(RunConfig::default()));
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.exp_root, PathBuf::from("from_recipe"));
    }

    #[test]
    fn test_parse_flag() {
        let flag = parse_flag("speed_perturb=_sp").unwrap();
        assert_eq!(flag, TagFlag::new("speed_perturb", true, "_sp"));
        assert!(parse_flag("nosuffix").is_err());
        assert!(parse_flag("=_x").is_err());
    }

    #[test]
    fn test_tag_args_resolve() {
        let cli = Cli::try_parse_from([
            "shardflow", "tag", "--base", "train", "--config", "conf/train_asr.yaml",
            "--args", "--lr 0.1", "--flag", "sp=_sp",
        ])
        .unwrap();
        let Command::Tag(args) = cli.command else {
            panic!("expected tag");
        };
        assert_eq!(tag::resolve(&args.inputs()), "train_asr_lr0.1_sp");
    }

    #[tokio::test]
    async fn test_split_and_merge_commands() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("wav.scp");
        std::fs::write(&manifest, "u1 a\nu2 b\nu3 c\n").unwrap();
        let split_dir = dir.path().join("split2");

        let cli = Cli::try_parse_from([
            "shardflow".into(), "split".into(), "--manifest".into(), manifest.clone().into_os_string(),
            "--nj".into(), "2".into(), "--out-dir".into(), split_dir.clone().into_os_string(),
        ])
        .unwrap();
        execute(cli).await.unwrap();
        assert!(split_dir.join("keys.1.scp").is_file());
        assert!(split_dir.join("keys.2.scp").is_file());

        let out = dir.path().join("merged/wav.scp");
        let cli = Cli::try_parse_from([
            "shardflow".into(), "merge".into(), "--mode".into(), "stream".into(),
            "--out".into(), out.clone().into_os_string(),
            "--manifest".into(), manifest.into_os_string(),
            split_dir.join("keys.2.scp").into_os_string(),
            split_dir.join("keys.1.scp").into_os_string(),
        ])
        .unwrap();
        execute(cli).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "u1 a\nu2 b\nu3 c\n");
    }

    #[tokio::test]
    async fn test_missing_recipe_is_invalid_invocation() {
        let cli = Cli::try_parse_from(["shardflow", "run", "--recipe", "/nonexistent/recipe.json"]).unwrap();
        let err = execute(cli).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
