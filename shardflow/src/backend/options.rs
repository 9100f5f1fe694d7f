//! Declarative mapping from resource requests to scheduler flags.
//!
//! Tables use the queue configuration format:
//!
//! ```text
//! command sbatch --export=PATH
//! status squeue -h -j
//! option name=* --job-name $0
//! option gpu=0 -p cpu
//! option gpu=* -p gpu --gres=gpu:$0
//! default gpu=0
//! ```
//!
//! An exact `key=value` rule wins over a `key=*` rule. A rule with no flags
//! accepts the value and emits nothing. The optional `status` line is the
//! command that, given a job id, prints something while the job is queued or
//! running.

use crate::errors::{ConfigurationError, ShardflowResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use super::ResourceRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct KeyRules {
    exact: BTreeMap<String, Vec<String>>,
    wildcard: Option<Vec<String>>,
}

/// Maps resource keys and values to backend-native flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionTable {
    command: Vec<String>,
    status: Vec<String>,
    rules: BTreeMap<String, KeyRules>,
    defaults: BTreeMap<String, String>,
}

static OPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^option\s+([A-Za-z_][A-Za-z0-9_]*)=(\S+)\s*(.*)$").expect("option line pattern")
});

static DEFAULT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^default\s+([A-Za-z_][A-Za-z0-9_]*)=(\S+)\s*$").expect("default line pattern")
});

impl OptionTable {
    /// Creates a table with the given submission command.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the job status command; the job id is appended as last argument.
    #[must_use]
    pub fn with_status_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.status = command.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a rule. `value` of `*` makes it a wildcard rule.
    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str, flags: &str) -> Self {
        let flags: Vec<String> = flags.split_whitespace().map(str::to_string).collect();
        let rules = self.rules.entry(key.to_string()).or_default();
        if value == "*" {
            rules.wildcard = Some(flags);
        } else {
            rules.exact.insert(value.to_string(), flags);
        }
        self
    }

    /// Adds a default value.
    #[must_use]
    pub fn with_default(mut self, key: &str, value: &str) -> Self {
        self.defaults.insert(key.to_string(), value.to_string());
        self
    }

    /// Parses a table from text.
    pub fn parse(text: &str) -> ShardflowResult<Self> {
        let mut table = Self::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("command") {
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    table.command = rest.split_whitespace().map(str::to_string).collect();
                    continue;
                }
            }
            if let Some(rest) = line.strip_prefix("status") {
                if rest.starts_with(char::is_whitespace) {
                    table.status = rest.split_whitespace().map(str::to_string).collect();
                    continue;
                }
            }
            if let Some(caps) = OPTION_LINE.captures(line) {
                table = table.with_option(&caps[1], &caps[2], &caps[3]);
                continue;
            }
            if let Some(caps) = DEFAULT_LINE.captures(line) {
                table = table.with_default(&caps[1], &caps[2]);
                continue;
            }

            return Err(ConfigurationError::new(format!(
                "unrecognized queue config line {}: '{line}'",
                lineno + 1
            ))
            .with_key("queue_conf")
            .into());
        }

        Ok(table)
    }

    /// Loads a table from a file.
    pub fn load(path: impl AsRef<Path>) -> ShardflowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read queue config {}: {e}", path.display()))
                .with_key("queue_conf")
        })?;
        Self::parse(&text)
    }

    /// Built-in grid-engine table.
    #[must_use]
    pub fn grid_engine() -> Self {
        Self::new(["qsub", "-v", "PATH", "-cwd", "-S", "/bin/sh", "-j", "y"])
            .with_status_command(["qstat", "-j"])
            .with_option("name", "*", "-N $0")
            .with_option("mem", "*", "-l mem_free=$0,ram_free=$0")
            .with_option("mem", "0", "")
            .with_option("cpu", "*", "-pe smp $0")
            .with_option("cpu", "1", "")
            .with_option("time", "*", "-l h_rt=$0")
            .with_option("nodes", "1", "")
            .with_option("max_jobs_run", "*", "-tc $0")
            .with_option("gpu", "*", "-l gpu=$0 -q g.q")
            .with_option("gpu", "0", "-q all.q")
            .with_default("gpu", "0")
    }

    /// Built-in Slurm table.
    #[must_use]
    pub fn slurm() -> Self {
        Self::new(["sbatch", "--export=PATH"])
            .with_status_command(["squeue", "-h", "-j"])
            .with_option("name", "*", "--job-name $0")
            .with_option("time", "*", "--time $0")
            .with_option("mem", "*", "--mem-per-cpu $0")
            .with_option("mem", "0", "")
            .with_option("cpu", "*", "--cpus-per-task $0")
            .with_option("nodes", "*", "--nodes $0")
            .with_option("max_jobs_run", "*", "")
            .with_option("gpu", "0", "-p cpu")
            .with_option("gpu", "*", "-p gpu --gres=gpu:$0")
            .with_default("gpu", "0")
    }

    /// Table for the local backend: every recognised key is accepted and
    /// produces no flags.
    #[must_use]
    pub fn local() -> Self {
        ["gpu", "cpu", "mem", "time", "nodes", "name", "max_jobs_run"]
            .into_iter()
            .fold(Self::default(), |table, key| table.with_option(key, "*", ""))
    }

    /// Returns the submission command.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Returns the job status command, empty when the table has none.
    #[must_use]
    pub fn status_command(&self) -> &[String] {
        &self.status
    }

    /// Returns true if the table has any rule for `key`.
    #[must_use]
    pub fn supports(&self, key: &str) -> bool {
        self.rules.contains_key(key)
    }

    /// Renders flags for a request, defaults filled in, keys in sorted order.
    ///
    /// A key with no rule, or a value matching no rule, is a
    /// [`ConfigurationError`].
    pub fn render_flags(&self, request: &ResourceRequest) -> ShardflowResult<Vec<String>> {
        let mut effective = self.defaults.clone();
        effective.extend(request.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut flags = Vec::new();
        for (key, value) in &effective {
            let rules = self.rules.get(key).ok_or_else(|| {
                ConfigurationError::new(format!("unknown resource option '{key}={value}'"))
                    .with_key(key.clone())
            })?;

            if let Some(exact) = rules.exact.get(value) {
                flags.extend(exact.iter().cloned());
            } else if let Some(wildcard) = &rules.wildcard {
                flags.extend(wildcard.iter().map(|f| f.replace("$0", value)));
            } else {
                return Err(ConfigurationError::new(format!(
                    "unsupported value '{value}' for resource option '{key}'"
                ))
                .with_key(key.clone())
                .into());
            }
        }

        Ok(flags)
    }

    /// Checks a request against the table without rendering.
    pub fn validate(&self, request: &ResourceRequest) -> ShardflowResult<()> {
        self.render_flags(request).map(|_| ())
    }
}
