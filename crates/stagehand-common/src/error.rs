//! Unified error types for the Stagehand workspace.
//!
//! Variants follow the startup error taxonomy: configuration,
//! synchronization, security policy, exec, hooks, and the attach service.
//! Every variant renders as a single line naming the failing step.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StagehandError {
    /// An I/O operation on a filesystem path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The same resource limit kind was listed more than once.
    #[error("invalid configuration: duplicate resource limit kind {kind}")]
    DuplicateRlimit {
        /// The duplicated kind, as written in the container description.
        kind: String,
    },

    /// Applying a resource limit failed at the OS level.
    #[error("failed to set resource limit {kind}: {source}")]
    Rlimit {
        /// Kind being applied.
        kind: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Adopting the pseudo-terminal as the controlling terminal failed.
    #[error("terminal setup failed at {step}: {source}")]
    Terminal {
        /// Terminal setup step that failed.
        step: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The controller/runner handshake failed or was violated.
    #[error("handshake failed while {step}: {message}")]
    Sync {
        /// Step of the startup sequence that failed.
        step: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Applying the security policy failed.
    #[error("failed to apply security configuration: {message}")]
    Policy {
        /// Description of the failure.
        message: String,
    },

    /// The executable could not be resolved or the image replacement failed.
    #[error("exec {program} failed: {message}")]
    Exec {
        /// Program being executed.
        program: String,
        /// Description of the failure.
        message: String,
    },

    /// A lifecycle hook failed.
    #[error("{stage} hook {path} failed: {message}")]
    Hook {
        /// Lifecycle point of the hook (`prestart`, `poststart`).
        stage: &'static str,
        /// Path of the hook executable.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The attach service could not be created or stopped accepting clients.
    #[error("attach socket {path}: {source}")]
    Attach {
        /// Path of the attach socket.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StagehandError {
    /// Builds a synchronization error for the given startup step.
    pub fn sync(step: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Sync {
            step,
            message: message.to_string(),
        }
    }

    /// Builds a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StagehandError>;
