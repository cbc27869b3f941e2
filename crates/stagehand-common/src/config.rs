//! Global configuration model for the Stagehand runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the Stagehand runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for instance metadata, state, and attach sockets.
    pub data_dir: PathBuf,
    /// Number of attach clients wired into a session before new ones are
    /// turned away.
    pub attach_client_limit: usize,
}

impl RuntimeConfig {
    /// Creates a configuration rooted at the given data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Self::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            attach_client_limit: crate::constants::MAX_ATTACH_CLIENTS,
        }
    }
}
