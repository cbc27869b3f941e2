//! Persistent container state.
//!
//! The controller publishes every lifecycle transition to a JSON file next
//! to the instance metadata, where inspection tooling can read it. The
//! runner never touches it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::types::StateSnapshot;

/// Durably records a state snapshot.
pub trait StatePersister: Send + Sync {
    /// Records `state`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn persist(&self, state: &StateSnapshot) -> Result<()>;
}

/// On-disk record of a container's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    /// The published snapshot.
    #[serde(flatten)]
    pub state: StateSnapshot,
    /// RFC 3339 timestamp of the write.
    pub updated_at: String,
}

/// State persisted as a JSON file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    /// Uses the state file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `state.json` in the directory of an instance file.
    #[must_use]
    pub fn for_instance(instance_file: &Path) -> Self {
        let dir = instance_file.parent().unwrap_or_else(|| Path::new("/"));
        Self::new(dir.join(stagehand_common::constants::STATE_FILE_NAME))
    }

    /// Returns the state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be parsed.
    pub fn load(&self) -> Result<StateRecord> {
        tracing::debug!(path = %self.path.display(), "loading state");
        let content = std::fs::read_to_string(&self.path).map_err(|e| StagehandError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl StatePersister for JsonStateFile {
    fn persist(&self, state: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StagehandError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let record = StateRecord {
            state: state.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StagehandError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StagehandError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %self.path.display(), status = %state.status, "state saved");
        Ok(())
    }
}
