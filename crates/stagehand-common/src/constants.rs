//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Stagehand data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/stagehand";

/// Returns the data directory, preferring `$HOME/.stagehand` when it can be
/// created, falling back to `/var/lib/stagehand`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".stagehand");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Annotation key publishing the attach socket path.
pub const ATTACH_SOCKET_ANNOTATION: &str = "io.sylabs.runtime.oci.attach-socket";

/// Maximum number of attach clients wired into one session.
pub const MAX_ATTACH_CLIENTS: usize = 10;

/// Version string written into published state.
pub const OCI_VERSION: &str = "1.0.2";

/// Name of the per-instance state file.
pub const STATE_FILE_NAME: &str = "state.json";

/// Subdirectory of the data directory holding instance metadata.
pub const INSTANCES_DIR: &str = "instances";

/// Exit status of a runner that failed before exec.
pub const RUNNER_FAILURE_EXIT: i32 = 255;
