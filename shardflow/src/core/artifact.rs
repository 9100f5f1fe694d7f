//! Artifact directories: the only state that crosses stage boundaries.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The on-disk output of a stage.
///
/// Downstream stages treat the path as an opaque handle. The tag is produced
/// by [`TagResolver`](crate::tag::TagResolver) and is a pure function of the
/// configuration that produced the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDirectory {
    /// Configuration fingerprint naming the directory.
    pub tag: String,

    /// Where the artifact lives.
    pub path: PathBuf,

    /// The stage that produced it, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<u32>,

    /// When the artifact was produced (RFC 3339).
    pub created_at: String,
}

impl ArtifactDirectory {
    /// Creates a new artifact directory handle.
    #[must_use]
    pub fn new(tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            path: path.into(),
            stage_id: None,
            created_at: super::iso_timestamp(),
        }
    }

    /// Records the producing stage.
    #[must_use]
    pub fn with_stage(mut self, stage_id: u32) -> Self {
        self.stage_id = Some(stage_id);
        self
    }

    /// Returns the artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a path inside the artifact directory.
    #[must_use]
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Creates the directory (and parents) if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.path)
    }
}
