//! Backend-neutral resource requests.

use crate::errors::{ConfigurationError, ShardflowResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An open key/value resource request.
///
/// Recognised keys are `gpu`, `cpu`, `mem`, `time`, `nodes`, `name` and
/// `max_jobs_run`, but the set is open: whether a key is valid is decided by
/// the backend's [`OptionTable`](super::OptionTable).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequest(BTreeMap<String, String>);

impl ResourceRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Requests GPUs. `0` selects the CPU-only path.
    #[must_use]
    pub fn gpu(self, count: u32) -> Self {
        self.with("gpu", count)
    }

    /// Requests CPU threads per job.
    #[must_use]
    pub fn cpu(self, count: u32) -> Self {
        self.with("cpu", count)
    }

    /// Requests memory, in the backend's notation (e.g. `4G`).
    #[must_use]
    pub fn mem(self, mem: impl Into<String>) -> Self {
        self.with("mem", mem.into())
    }

    /// Requests wall-clock time, in the backend's notation.
    #[must_use]
    pub fn time(self, time: impl Into<String>) -> Self {
        self.with("time", time.into())
    }

    /// Requests nodes.
    #[must_use]
    pub fn nodes(self, count: u32) -> Self {
        self.with("nodes", count)
    }

    /// Sets the job name.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        self.with("name", name.into())
    }

    /// Caps how many jobs of the array run at once.
    #[must_use]
    pub fn max_jobs_run(self, count: usize) -> Self {
        self.with("max_jobs_run", count)
    }

    /// Returns the value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if the key is set.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns true if nothing is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy with `other`'s keys laid over this request.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut map = self.0.clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(map)
    }

    /// Parses `max_jobs_run`, if present.
    pub fn max_jobs_run_value(&self) -> ShardflowResult<Option<usize>> {
        match self.get("max_jobs_run") {
            None => Ok(None),
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Some(n)),
                _ => Err(ConfigurationError::new(format!(
                    "max_jobs_run must be a positive integer, got '{raw}'"
                ))
                .with_key("max_jobs_run")
                .into()),
            },
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceRequest {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
