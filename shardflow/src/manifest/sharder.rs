//! Contiguous partitioning of a manifest into shards.

use super::{render_entries, ManifestEntry, WorkManifest};
use crate::errors::{ConfigurationError, EmptyManifestError, ShardflowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How shard sizes are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Every shard holds `ceil(n / s)` items; the last takes the remainder.
    #[default]
    Contiguous,
    /// Exactly `s` shards whose sizes differ by at most one.
    Balanced,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contiguous => write!(f, "contiguous"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

/// A contiguous slice of a manifest, processed by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// 1-based shard index.
    pub index: usize,
    /// The items of this shard, in manifest order.
    pub entries: Vec<ManifestEntry>,
}

impl Shard {
    /// Returns the item ids of this shard.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the shard holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File name of this shard's key file.
    #[must_use]
    pub fn key_file_name(&self) -> String {
        format!("keys.{}.scp", self.index)
    }

    /// Writes `keys.<index>.scp` into `dir` and returns its path.
    pub fn write_key_file(&self, dir: &Path) -> ShardflowResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.key_file_name());
        std::fs::write(&path, render_entries(&self.entries))?;
        Ok(path)
    }
}

/// Splits a manifest with the default [`SplitStrategy::Contiguous`] rule.
pub fn split(manifest: &WorkManifest, max_parallelism: usize) -> ShardflowResult<Vec<Shard>> {
    split_with(manifest, max_parallelism, SplitStrategy::Contiguous)
}

/// Splits a manifest into at most `max_parallelism` contiguous shards.
///
/// Manifest order is preserved and every item lands in exactly one shard.
/// No shard is empty.
pub fn split_with(
    manifest: &WorkManifest,
    max_parallelism: usize,
    strategy: SplitStrategy,
) -> ShardflowResult<Vec<Shard>> {
    if max_parallelism == 0 {
        return Err(ConfigurationError::new("parallelism must be at least 1")
            .with_key("parallelism")
            .into());
    }
    if manifest.is_empty() {
        return Err(EmptyManifestError::new(manifest.name()).into());
    }

    let n = manifest.len();
    let s = max_parallelism.min(n);
    let sizes = match strategy {
        SplitStrategy::Contiguous => contiguous_sizes(n, s),
        SplitStrategy::Balanced => balanced_sizes(n, s),
    };

    let mut shards = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for (i, size) in sizes.into_iter().enumerate() {
        shards.push(Shard {
            index: i + 1,
            entries: manifest.entries()[offset..offset + size].to_vec(),
        });
        offset += size;
    }
    debug_assert_eq!(offset, n);

    Ok(shards)
}

fn contiguous_sizes(n: usize, s: usize) -> Vec<usize> {
    let chunk = n.div_ceil(s);
    let mut sizes = Vec::with_capacity(s);
    let mut remaining = n;
    while remaining > 0 {
        let size = chunk.min(remaining);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

fn balanced_sizes(n: usize, s: usize) -> Vec<usize> {
    let base = n / s;
    let extra = n % s;
    (0..s).map(|i| base + usize::from(i < extra)).collect()
}
