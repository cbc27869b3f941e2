//! Container description consumed by the runner and the controller.
//!
//! This is the subset of the OCI runtime `config.json` that matters once a
//! child process exists: the process block and the lifecycle hooks.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagehandError};

/// Container description read from a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// The container's entry process.
    pub process: ProcessSpec,
    /// Lifecycle hooks.
    #[serde(default)]
    pub hooks: Hooks,
    /// Free-form annotations copied into the published state.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Parses a container description from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or the process has
    /// no arguments.
    pub fn from_json(text: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(text)?;
        spec.process.validate()?;
        Ok(spec)
    }

    /// Reads and parses a container description from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StagehandError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&text)
    }
}

/// The entry process of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// Working directory; must be absolute. Empty means `/`.
    #[serde(default)]
    pub cwd: PathBuf,
    /// Argument vector; `args[0]` is resolved against the search path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as ordered `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Resource limits applied before exec, in order.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// Whether the process may not gain privileges through exec.
    #[serde(default)]
    pub no_new_privileges: bool,
    /// Whether a pseudo-terminal should be allocated.
    #[serde(default)]
    pub terminal: bool,
    /// Allocated pseudo-terminal, filled in by the launcher.
    #[serde(skip)]
    pub pty: Option<PtyPair>,
}

impl ProcessSpec {
    /// Checks the fields that the runner cannot do without.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument vector is empty.
    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() {
            return Err(StagehandError::config("process args must not be empty"));
        }
        Ok(())
    }

    /// Returns the search path set by a `PATH=` entry, if any.
    ///
    /// When several entries set `PATH`, the last one wins.
    #[must_use]
    pub fn path_override(&self) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find_map(|e| e.strip_prefix("PATH="))
    }
}

/// A single resource limit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit kind, e.g. `RLIMIT_NOFILE` or `nofile`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

impl Rlimit {
    /// Creates a limit entry.
    #[must_use]
    pub fn new(kind: impl Into<String>, soft: u64, hard: u64) -> Self {
        Self {
            kind: kind.into(),
            soft,
            hard,
        }
    }
}

/// Master/slave descriptors of an allocated pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyPair {
    /// Controller side.
    pub master: RawFd,
    /// Side that becomes the process's standard streams.
    pub slave: RawFd,
}

/// Lifecycle hooks grouped by the point they are bound to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    /// Run after the process is stopped and before it is released.
    #[serde(default)]
    pub prestart: Vec<Hook>,
    /// Run after the process has replaced its image.
    #[serde(default)]
    pub poststart: Vec<Hook>,
}

/// An external hook executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Absolute path of the executable.
    pub path: PathBuf,
    /// Argument vector, including argv0. Empty means `[path]`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds after which the hook is killed and reported failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Lifecycle point a hook is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Before the process is released.
    Prestart,
    /// After the process is running.
    Poststart,
}

impl HookStage {
    /// Returns the OCI name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prestart => "prestart",
            Self::Poststart => "poststart",
        }
    }
}
