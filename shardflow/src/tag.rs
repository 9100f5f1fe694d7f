//! Artifact directory naming.
//!
//! A tag is a pure, syntactic fingerprint of the settings that produced an
//! artifact:
//!
//! ```text
//! conf/train_asr_conformer.yaml + "--lr 0.002 --batch_bins 1000" + sp
//!   -> train_asr_conformer_lr0.002_batch_bins1000_sp
//! ```
//!
//! Equal inputs always give equal tags, so a rerun with unchanged settings
//! lands in the same directory. Semantically equal but textually different
//! overrides give different tags.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default base name when no configuration file is given.
pub const DEFAULT_BASE_NAME: &str = "base";

/// Tags longer than this many bytes are shortened.
pub const MAX_TAG_LEN: usize = 200;

const HASH_SUFFIX_LEN: usize = 16;

static STRIPPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ |=/]").expect("tag strip pattern"));

/// An optional suffix, appended when enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFlag {
    /// What the flag means (e.g. `speed_perturb`).
    pub name: String,
    /// Whether the suffix applies.
    pub enabled: bool,
    /// Suffix appended when enabled (e.g. `_sp`).
    pub suffix: String,
}

impl TagFlag {
    /// Creates a flag.
    #[must_use]
    pub fn new(name: impl Into<String>, enabled: bool, suffix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled,
            suffix: suffix.into(),
        }
    }
}

/// Everything a tag is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInputs {
    /// Fallback when there is no configuration file.
    #[serde(default)]
    pub base_name: Option<String>,
    /// Configuration file whose stem identifies the setup.
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Override arguments, as given on the command line.
    #[serde(default)]
    pub override_args: Option<String>,
    /// Suffix flags, applied in order.
    #[serde(default)]
    pub flags: Vec<TagFlag>,
    /// A tag chosen by the operator; wins over everything else.
    #[serde(default)]
    pub explicit_tag: Option<String>,
}

impl TagInputs {
    /// Inputs with the given fallback base name.
    #[must_use]
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: Some(base_name.into()),
            ..Self::default()
        }
    }

    /// Sets the configuration file.
    #[must_use]
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Sets the override arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.override_args = Some(args.into());
        self
    }

    /// Adds a flag.
    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>, enabled: bool, suffix: impl Into<String>) -> Self {
        self.flags.push(TagFlag::new(name, enabled, suffix));
        self
    }

    /// Sets an explicit tag.
    #[must_use]
    pub fn with_explicit_tag(mut self, tag: impl Into<String>) -> Self {
        self.explicit_tag = Some(tag.into());
        self
    }
}

/// Derives tags from [`TagInputs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagResolver {
    max_len: usize,
}

impl Default for TagResolver {
    fn default() -> Self {
        Self {
            max_len: MAX_TAG_LEN,
        }
    }
}

impl TagResolver {
    /// Creates a resolver with the default length cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the length cap. Values below 32 are raised to 32.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(2 * HASH_SUFFIX_LEN);
        self
    }

    /// Resolves the tag for `inputs`.
    #[must_use]
    pub fn resolve(&self, inputs: &TagInputs) -> String {
        if let Some(tag) = inputs.explicit_tag.as_deref().filter(|t| !t.is_empty()) {
            return tag.to_string();
        }

        let mut tag = config_id(inputs);
        if let Some(args) = inputs.override_args.as_deref() {
            tag.push_str(&normalize_args(args));
        }
        for flag in inputs.flags.iter().filter(|f| f.enabled) {
            tag.push_str(&flag.suffix);
        }

        self.shorten(tag)
    }

    fn shorten(&self, tag: String) -> String {
        if tag.len() <= self.max_len {
            return tag;
        }
        let digest = hex::encode(Sha256::digest(tag.as_bytes()));
        let mut cut = self.max_len - HASH_SUFFIX_LEN - 1;
        while !tag.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}_{}", &tag[..cut], &digest[..HASH_SUFFIX_LEN])
    }
}

/// Resolves a tag with the default resolver.
#[must_use]
pub fn resolve(inputs: &TagInputs) -> String {
    TagResolver::default().resolve(inputs)
}

/// `{exp_root}/{kind}_{tag}`.
#[must_use]
pub fn artifact_dir(exp_root: &Path, kind: &str, tag: &str) -> PathBuf {
    exp_root.join(format!("{kind}_{tag}"))
}

fn config_id(inputs: &TagInputs) -> String {
    inputs
        .config
        .as_deref()
        .and_then(Path::file_stem)
        .map(|stem| stem.to_string_lossy().into_owned())
        .or_else(|| inputs.base_name.clone())
        .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string())
}

/// `--` becomes `_`, then spaces, `|`, `=` and `/` are dropped.
fn normalize_args(args: &str) -> String {
    STRIPPED.replace_all(&args.replace("--", "_"), "").into_owned()
}
