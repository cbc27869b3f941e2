//! Executable lookup and process image replacement.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use stagehand_common::error::{Result, StagehandError};

/// Resolves `program` against the executable search path.
///
/// `path_override` replaces the inherited `PATH` when the container's
/// environment sets one. Names containing a slash are resolved relative to
/// `cwd` without consulting the search path.
///
/// # Errors
///
/// Returns an exec error if no executable is found.
pub fn resolve_program(program: &str, path_override: Option<&str>, cwd: &Path) -> Result<PathBuf> {
    let search = path_override
        .map(std::ffi::OsString::from)
        .or_else(|| std::env::var_os("PATH"));

    which::which_in(program, search, cwd).map_err(|e| StagehandError::Exec {
        program: program.to_string(),
        message: e.to_string(),
    })
}

/// Replaces the process image with `program`.
///
/// Never returns on success. The error is the only value that can come
/// back, and by then the old image is still running.
///
/// # Errors
///
/// Returns an exec error if an argument contains a NUL byte or `execve(2)`
/// fails.
pub fn replace_image(program: &Path, args: &[String], env: &[String]) -> Result<Infallible> {
    let fail = |message: String| StagehandError::Exec {
        program: program.display().to_string(),
        message,
    };

    let path = CString::new(program.as_os_str().as_encoded_bytes())
        .map_err(|e| fail(e.to_string()))?;
    let argv = to_cstrings(args).map_err(|e| fail(e.to_string()))?;
    let envp = to_cstrings(env).map_err(|e| fail(e.to_string()))?;

    tracing::debug!(program = %program.display(), "replacing process image");
    nix::unistd::execve(&path, &argv, &envp).map_err(|e| fail(e.to_string()))
}

fn to_cstrings(items: &[String]) -> std::result::Result<Vec<CString>, std::ffi::NulError> {
    items.iter().map(|s| CString::new(s.as_bytes())).collect()
}
