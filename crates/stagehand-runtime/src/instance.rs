//! Per-instance metadata locations.

use std::path::{Path, PathBuf};

use stagehand_common::types::ContainerId;

/// Maps a container identifier to its instance metadata file.
pub trait InstanceLocator: Send + Sync {
    /// Returns the path of the instance file for `id`.
    fn instance_file(&self, id: &ContainerId) -> PathBuf;
}

/// Instance files laid out as `<root>/instances/<id>/<id>.json`.
#[derive(Debug, Clone)]
pub struct InstanceDir {
    root: PathBuf,
}

impl InstanceDir {
    /// Creates a locator rooted at the runtime data directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the data directory this locator is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl InstanceLocator for InstanceDir {
    fn instance_file(&self, id: &ContainerId) -> PathBuf {
        self.root
            .join(stagehand_common::constants::INSTANCES_DIR)
            .join(id.as_str())
            .join(format!("{id}.json"))
    }
}

/// Attach socket path for an instance: `<dir of instance file>/<id>.sock`.
#[must_use]
pub fn attach_socket_path(instance_file: &Path, id: &ContainerId) -> PathBuf {
    instance_file
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .join(format!("{id}.sock"))
}

/// Output capture path for an instance: `<dir of instance file>/<id>.log`.
#[must_use]
pub fn log_path(instance_file: &Path, id: &ContainerId) -> PathBuf {
    instance_file
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .join(format!("{id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_file_is_scoped_by_id() {
        let dirs = InstanceDir::new("/var/lib/stagehand");
        let file = dirs.instance_file(&ContainerId::new("abc"));
        assert_eq!(file, PathBuf::from("/var/lib/stagehand/instances/abc/abc.json"));
    }

    #[test]
    fn attach_socket_sits_next_to_instance_file() {
        let id = ContainerId::new("abc");
        let file = InstanceDir::new("/data").instance_file(&id);
        assert_eq!(
            attach_socket_path(&file, &id),
            PathBuf::from("/data/instances/abc/abc.sock")
        );
        assert_eq!(log_path(&file, &id), PathBuf::from("/data/instances/abc/abc.log"));
    }
}
