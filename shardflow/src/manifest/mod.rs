//! Work manifests and sharding.
//!
//! A manifest is an ordered list of work-item ids, each mapped to zero or
//! more resource paths. Manifests are stored as scp-style text files:
//!
//! ```text
//! utt1 /data/wav/utt1.wav
//! utt2 /data/wav/utt2.wav
//! ```

mod sharder;

pub use sharder::{split, split_with, Shard, SplitStrategy};

use crate::errors::{ConfigurationError, ShardflowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One work item: an id and the resources it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Unique item id.
    pub id: String,
    /// Resource paths. May be empty for key-only manifests.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl ManifestEntry {
    /// Creates an entry with the given paths.
    #[must_use]
    pub fn new(id: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            id: id.into(),
            paths,
        }
    }

    /// Creates a key-only entry.
    #[must_use]
    pub fn key(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    /// Renders the entry as one scp line without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        if self.paths.is_empty() {
            self.id.clone()
        } else {
            format!("{} {}", self.id, self.paths.join(" "))
        }
    }
}

/// An ordered, read-only enumeration of work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkManifest {
    name: String,
    entries: Vec<ManifestEntry>,
}

impl WorkManifest {
    /// Builds a manifest from entries, rejecting duplicate ids.
    pub fn from_entries(
        name: impl Into<String>,
        entries: Vec<ManifestEntry>,
    ) -> ShardflowResult<Self> {
        let name = name.into();
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigurationError::new(format!(
                    "duplicate id '{}' in manifest '{name}'",
                    entry.id
                ))
                .into());
            }
        }
        Ok(Self { name, entries })
    }

    /// Builds a key-only manifest from ids.
    pub fn from_ids<I, S>(name: impl Into<String>, ids: I) -> ShardflowResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_entries(name, ids.into_iter().map(ManifestEntry::key).collect())
    }

    /// Parses scp-formatted text.
    ///
    /// Blank lines are skipped. Duplicate ids are reported with their line
    /// number.
    pub fn parse(name: impl Into<String>, text: &str) -> ShardflowResult<Self> {
        let name = name.into();
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (lineno, line) in text.lines().enumerate() {
            let mut fields = line.split_ascii_whitespace();
            let Some(id) = fields.next() else {
                continue;
            };
            if !seen.insert(id.to_string()) {
                return Err(ConfigurationError::new(format!(
                    "duplicate id '{id}' at {name}:{}",
                    lineno + 1
                ))
                .into());
            }
            entries.push(ManifestEntry::new(id, fields.map(str::to_string).collect()));
        }

        Ok(Self { name, entries })
    }

    /// Reads a manifest file. The manifest is named after the path.
    pub fn read(path: impl AsRef<Path>) -> ShardflowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read manifest {}: {e}", path.display()))
                .with_key("manifest")
        })?;
        Self::parse(path.display().to_string(), &text)
    }

    /// Writes the manifest in scp format.
    pub fn write(&self, path: impl AsRef<Path>) -> ShardflowResult<()> {
        std::fs::write(path, self.to_scp_string())?;
        Ok(())
    }

    /// Renders the manifest in scp format, one entry per line.
    #[must_use]
    pub fn to_scp_string(&self) -> String {
        render_entries(&self.entries)
    }

    /// Returns the manifest name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entries in order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Returns the ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the manifest has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn render_entries(entries: &[ManifestEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    out
}
