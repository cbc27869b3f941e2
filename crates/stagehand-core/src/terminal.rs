//! Pseudo-terminal adoption for the container process.
//!
//! The slave side becomes stdin, stdout and stderr, both original
//! descriptors are closed, and the process becomes a session leader whose
//! controlling terminal is the slave.

use std::os::fd::RawFd;

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::PtyPair;

/// Makes the pseudo-terminal slave the process's standard streams and
/// controlling terminal.
///
/// # Errors
///
/// Returns an error naming the first step that failed. Any failure here is
/// fatal to startup.
pub fn adopt_terminal(pty: PtyPair) -> Result<()> {
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup_onto(pty.slave, target)?;
    }
    close(pty.master, "close master")?;
    if pty.slave > libc::STDERR_FILENO {
        close(pty.slave, "close slave")?;
    }

    let _ = nix::unistd::setsid().map_err(|e| StagehandError::Terminal {
        step: "setsid",
        source: e.into(),
    })?;

    // SAFETY: stdin now refers to the pty slave and the calling process is a
    // session leader without a controlling terminal.
    if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 1) } < 0 {
        return Err(StagehandError::Terminal {
            step: "set controlling terminal",
            source: std::io::Error::last_os_error(),
        });
    }
    tracing::debug!("controlling terminal attached");
    Ok(())
}

fn dup_onto(fd: RawFd, target: RawFd) -> Result<()> {
    // SAFETY: dup2 only manipulates the descriptor table; both values are
    // descriptor numbers owned by this process.
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(StagehandError::Terminal {
            step: "duplicate slave onto standard streams",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn close(fd: RawFd, step: &'static str) -> Result<()> {
    // SAFETY: the descriptor was handed to this process by the launcher and
    // is not wrapped by any owning Rust type.
    if unsafe { libc::close(fd) } < 0 {
        return Err(StagehandError::Terminal {
            step,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
