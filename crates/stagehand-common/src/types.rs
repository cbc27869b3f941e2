//! Domain primitive types used across the Stagehand workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagehandError};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a container ID from user input, rejecting values that
    /// cannot name an instance directory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if [`Self::validate`] rejects the id.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    /// Checks that the id is usable as a single path component.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty id, `.` or `..`, or an
    /// id containing `/` or NUL.
    pub fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\0']) {
            return Err(StagehandError::config(format!("invalid container id {id:?}")));
        }
        Ok(())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container as published to inspection tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// The entry process exists and is held before exec.
    Created,
    /// The entry process has replaced its image with the user command.
    Running,
    /// The controller has gone away.
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of a container's lifecycle state.
///
/// Serialized in the OCI state layout; this is what hooks receive on
/// stdin and what the state file holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Version of the state layout.
    pub oci_version: String,
    /// Container identifier.
    pub id: ContainerId,
    /// Current lifecycle state.
    pub status: ContainerState,
    /// PID of the container's entry process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Bundle directory the container was created from.
    #[serde(default)]
    pub bundle: PathBuf,
    /// Annotations published alongside the state.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl StateSnapshot {
    /// Creates a snapshot in the `Created` state with no annotations.
    #[must_use]
    pub fn new(id: ContainerId, bundle: PathBuf) -> Self {
        Self {
            oci_version: crate::constants::OCI_VERSION.to_string(),
            id,
            status: ContainerState::Created,
            pid: None,
            bundle,
            annotations: BTreeMap::new(),
        }
    }
}
