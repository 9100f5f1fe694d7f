//! Aggregation of shard outputs into one artifact.
//!
//! The aggregator runs only after the dispatcher's barrier succeeded, and is
//! the only writer of the consolidated artifact.

mod stats;
mod stream;

pub use stats::{add_values, merge_stats};
pub use stream::{check_coverage, merge_stream, merge_texts, record_key, record_lines};

use crate::core::ArtifactDirectory;
use crate::dispatch::AggregationInput;
use crate::errors::ShardflowResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// How shard outputs are combined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum MergeMode {
    /// Each shard writes `file`; lines are merged and sorted by item id.
    Stream {
        /// Record file name inside every shard output directory.
        file: String,
        /// Require every manifest item exactly once.
        #[serde(default)]
        check_coverage: bool,
    },
    /// Each shard output directory is a stats directory.
    Stats,
}

/// Merges the outputs of a successful stage task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregator {
    mode: MergeMode,
}

impl Aggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(mode: MergeMode) -> Self {
        Self { mode }
    }

    /// A stream merge of `file`.
    #[must_use]
    pub fn stream(file: impl Into<String>) -> Self {
        Self::new(MergeMode::Stream {
            file: file.into(),
            check_coverage: false,
        })
    }

    /// A stats merge.
    #[must_use]
    pub fn stats() -> Self {
        Self::new(MergeMode::Stats)
    }

    /// Enables the manifest coverage check for stream merges.
    #[must_use]
    pub fn with_coverage_check(mut self) -> Self {
        if let MergeMode::Stream { check_coverage, .. } = &mut self.mode {
            *check_coverage = true;
        }
        self
    }

    /// Returns the merge mode.
    #[must_use]
    pub fn mode(&self) -> &MergeMode {
        &self.mode
    }

    /// Merges every shard output of `input` into the directory `dest`.
    pub fn merge(
        &self,
        input: &AggregationInput,
        dest: &Path,
        tag: &str,
    ) -> ShardflowResult<ArtifactDirectory> {
        let artifact = ArtifactDirectory::new(tag, dest);
        artifact.ensure()?;

        match &self.mode {
            MergeMode::Stream {
                file,
                check_coverage: check,
            } => {
                let sources: Vec<(usize, PathBuf)> = input
                    .shard_outputs
                    .iter()
                    .map(|s| (s.index, s.output_dir.join(file)))
                    .collect();
                let merged = merge_stream(&sources)?;
                if *check {
                    if let Some(manifest) = &input.manifest {
                        check_coverage(&merged, manifest)?;
                    }
                }
                std::fs::write(dest.join(file), &merged)?;
                info!(
                    task = %input.task,
                    shards = sources.len(),
                    records = record_lines(&merged).count(),
                    dest = %dest.display(),
                    "Merged shard records"
                );
            }
            MergeMode::Stats => {
                let sources: Vec<(usize, PathBuf)> = input
                    .shard_outputs
                    .iter()
                    .map(|s| (s.index, s.output_dir.clone()))
                    .collect();
                let written = merge_stats(&sources, dest)?;
                info!(
                    task = %input.task,
                    shards = sources.len(),
                    files = written.len(),
                    dest = %dest.display(),
                    "Merged shard stats"
                );
            }
        }

        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ShardOutput;
    use crate::manifest::WorkManifest;
    use std::sync::Arc;

    fn input(root: &Path, shards: &[&str], manifest: Option<WorkManifest>) -> AggregationInput {
        let shard_outputs = shards
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let dir = root.join(format!("output.{}", i + 1));
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("text"), text).unwrap();
                ShardOutput {
                    index: i + 1,
                    output_dir: dir,
                    key_file: None,
                }
            })
            .collect();
        AggregationInput {
            task: "decode".to_string(),
            shard_outputs,
            results: Vec::new(),
            manifest: manifest.map(Arc::new),
        }
    }

    #[test]
    fn test_stream_merge_writes_artifact() {
        let root = tempfile::tempdir().unwrap();
        let input = input(root.path(), &["u3 c\n", "u1 a\nu2 b\n"], None);
        let dest = root.path().join("asr_train");

        let artifact = Aggregator::stream("text").merge(&input, &dest, "train").unwrap();

        assert_eq!(artifact.tag, "train");
        assert_eq!(
            std::fs::read_to_string(dest.join("text")).unwrap(),
            "u1 a\nu2 b\nu3 c\n"
        );
    }

    #[test]
    fn test_stream_merge_coverage_check() {
        let root = tempfile::tempdir().unwrap();
        let manifest = WorkManifest::from_ids("m", ["u1", "u2", "u3"]).unwrap();
        let input = input(root.path(), &["u1 a\n", "u2 b\n"], Some(manifest));

        let err = Aggregator::stream("text")
            .with_coverage_check()
            .merge(&input, &root.path().join("out"), "t")
            .unwrap_err();
        assert_eq!(err.code(), "AGGREGATION_MISMATCH");
    }

    #[test]
    fn test_merge_mode_serde() {
        let mode: MergeMode = serde_json::from_str(r#"{"mode": "stream", "file": "text"}"#).unwrap();
        assert_eq!(
            mode,
            MergeMode::Stream {
                file: "text".into(),
                check_coverage: false
            }
        );
        let stats: MergeMode = serde_json::from_str(r#"{"mode": "stats"}"#).unwrap();
        assert_eq!(stats, MergeMode::Stats);
    }
}
