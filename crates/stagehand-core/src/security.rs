//! Security policy applied to the container process right before exec.
//!
//! The runner treats the policy as an opaque collaborator: it is invoked
//! exactly once, after working directory, limits and terminal are set up,
//! and any failure aborts startup.

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::ProcessSpec;

/// Applies mandatory access control and privilege restrictions to the
/// calling process.
pub trait SecurityPolicy: Send + Sync {
    /// Applies the policy for the given process.
    ///
    /// # Errors
    ///
    /// Returns an error if any restriction cannot be applied.
    fn apply(&self, process: &ProcessSpec) -> Result<()>;
}

/// Default policy: honours `noNewPrivileges`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNewPrivileges;

impl SecurityPolicy for NoNewPrivileges {
    fn apply(&self, process: &ProcessSpec) -> Result<()> {
        if process.no_new_privileges {
            nix::sys::prctl::set_no_new_privs().map_err(|e| StagehandError::Policy {
                message: format!("PR_SET_NO_NEW_PRIVS: {e}"),
            })?;
            tracing::debug!("no_new_privs set");
        }
        Ok(())
    }
}

/// Policy that applies nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfined;

impl SecurityPolicy for Unconfined {
    fn apply(&self, _process: &ProcessSpec) -> Result<()> {
        tracing::warn!("running without security policy");
        Ok(())
    }
}
