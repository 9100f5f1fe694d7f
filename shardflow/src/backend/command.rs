//! Backend-agnostic command specifications.

use crate::errors::{ConfigurationError, ShardflowResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default token replaced by the job index.
pub const DEFAULT_PLACEHOLDER: &str = "JOB";

/// A program and its arguments, with an index placeholder.
///
/// Any argument may contain the placeholder (default `JOB`), which is
/// replaced by the 1-based job index when the command is rendered for one
/// job. The placeholder only matches as a whole token: `log.JOB.txt` is
/// substituted, `JOBS` is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_placeholder")]
    placeholder: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

impl CommandSpec {
    /// Creates a command running `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            placeholder: default_placeholder(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Builds a command from an argv list.
    pub fn from_argv<I, S>(argv: I) -> ShardflowResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigurationError::new("command must not be empty").with_key("command"))?;
        Ok(Self::new(program).args(iter))
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the index placeholder token.
    #[must_use]
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// Sets an environment variable for the job.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory for the job.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Replaces `{name}` with `value` in the program and every argument.
    #[must_use]
    pub fn expand_var(mut self, name: &str, value: &str) -> Self {
        let needle = format!("{{{name}}}");
        self.program = self.program.replace(&needle, value);
        for arg in &mut self.args {
            *arg = arg.replace(&needle, value);
        }
        self
    }

    /// Returns the program.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the argument list.
    #[must_use]
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Returns the placeholder token.
    #[must_use]
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Renders the command for the job with the given index.
    #[must_use]
    pub fn render(&self, index: usize) -> RenderedCommand {
        let value = index.to_string();
        let sub = |s: &str| substitute_placeholder(s, &self.placeholder, &value);
        RenderedCommand {
            index,
            program: sub(&self.program),
            args: self.args.iter().map(|a| sub(a)).collect(),
            env: self.env.iter().map(|(k, v)| (k.clone(), sub(v))).collect(),
            cwd: self.cwd.clone(),
        }
    }
}

/// A command with the placeholder replaced for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    /// The job index this command was rendered for.
    pub index: usize,
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl RenderedCommand {
    /// Renders the command as a shell-quoted line, for logs and scripts.
    #[must_use]
    pub fn to_shell_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quotes a string for a POSIX shell, leaving plain words untouched.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn substitute_placeholder(text: &str, placeholder: &str, value: &str) -> String {
    if placeholder.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut consumed = 0;
    for (pos, _) in text.match_indices(placeholder) {
        let end = pos + placeholder.len();
        let before = text[..pos].chars().next_back();
        let after = text[end..].chars().next();
        out.push_str(&text[consumed..pos]);
        if is_word_char(before) || is_word_char(after) {
            out.push_str(placeholder);
        } else {
            out.push_str(value);
        }
        consumed = end;
    }
    out.push_str(&text[consumed..]);
    out
}
