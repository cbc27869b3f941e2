//! Startup handshake between the controller and the container process.
//!
//! The channel is a connected stream socket pair that lives only for the
//! startup sequence. Each message is a single byte:
//!
//! ```text
//! runner                                   controller
//!   | --- PauseNotify ----------------------> |  stop child, prestart hooks,
//!   |                                         |  attach socket, state=created
//!   | <-------------------------- ResumeAck - |
//!   |  security policy, exec                  |
//!   |  (close-on-exec drops the channel)      |
//!   | ------------------------------- EOF --> |  state=running, poststart hooks
//! ```
//!
//! Completion is signalled by channel closure, not by a message. A byte
//! arriving where the controller expects end-of-stream means the runner
//! failed after being released. A runner that fails before it pauses sends
//! `SetupFailed` followed by the error text and closes the channel.

use std::io::{Read, Write};

use stagehand_common::error::{Result, StagehandError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeToken {
    /// Runner to controller: configured and ready to be stopped.
    /// Also sent after release to report a failure before exec.
    PauseNotify = b't',
    /// Controller to runner: setup is done, proceed to exec.
    ResumeAck = b's',
    /// Runner to controller, instead of `PauseNotify`: configuration
    /// failed. The rest of the stream is the error message.
    SetupFailed = b'e',
}

impl HandshakeToken {
    /// Returns the wire encoding of the token.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for HandshakeToken {
    type Error = StagehandError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            b't' => Ok(Self::PauseNotify),
            b's' => Ok(Self::ResumeAck),
            b'e' => Ok(Self::SetupFailed),
            other => Err(StagehandError::sync(
                "decoding token",
                format!("unknown handshake byte {other:#04x}"),
            )),
        }
    }
}

/// Runner side of the handshake. Blocking.
#[derive(Debug)]
pub struct RunnerChannel<S> {
    stream: S,
}

impl<S: Read + Write> RunnerChannel<S> {
    /// Wraps the runner's end of the socket pair.
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Tells the controller the process is ready to be stopped.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error if the write fails.
    pub fn notify_pause(&mut self) -> Result<()> {
        self.stream
            .write_all(&[HandshakeToken::PauseNotify.as_byte()])
            .map_err(|e| StagehandError::sync("pausing process", e))
    }

    /// Blocks until the controller releases the process.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error if the read fails, the controller
    /// closes the channel, or anything other than `ResumeAck` arrives.
    pub fn await_resume(&mut self) -> Result<()> {
        let mut byte = [0_u8; 1];
        let n = self
            .stream
            .read(&mut byte)
            .map_err(|e| StagehandError::sync("waiting for resume", e))?;
        if n == 0 {
            return Err(StagehandError::sync(
                "waiting for resume",
                "controller closed the channel",
            ));
        }
        match HandshakeToken::try_from(byte[0])? {
            HandshakeToken::ResumeAck => Ok(()),
            other => Err(StagehandError::sync(
                "waiting for resume",
                format!("unexpected {other:?}"),
            )),
        }
    }

    /// Reports a failure before the pause, with its message, so the
    /// controller can surface the cause. Best effort.
    pub fn report_setup_failure(&mut self, error: &dyn std::fmt::Display) {
        let mut message = vec![HandshakeToken::SetupFailed.as_byte()];
        message.extend_from_slice(error.to_string().as_bytes());
        if let Err(e) = self.stream.write_all(&message) {
            tracing::error!(error = %e, "failed to report setup failure to controller");
        }
    }

    /// Reports a failure after release so the controller skips its
    /// post-start steps. Best effort: a write failure is only logged.
    pub fn signal_abort(&mut self) {
        if let Err(e) = self
            .stream
            .write_all(&[HandshakeToken::PauseNotify.as_byte()])
        {
            tracing::error!(error = %e, "failed to report startup failure to controller");
        }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Controller side of the handshake.
#[derive(Debug)]
pub struct ControllerChannel<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ControllerChannel<S> {
    /// Wraps the controller's end of the socket pair.
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Waits for the runner to report it is configured.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error on read failure, end-of-stream, or a
    /// token other than `PauseNotify`.
    pub async fn await_pause(&mut self) -> Result<()> {
        let mut byte = [0_u8; 1];
        let n = self
            .stream
            .read(&mut byte)
            .await
            .map_err(|e| StagehandError::sync("waiting for pause", e))?;
        if n == 0 {
            return Err(StagehandError::sync(
                "waiting for pause",
                "container process exited during setup",
            ));
        }
        match HandshakeToken::try_from(byte[0])? {
            HandshakeToken::PauseNotify => Ok(()),
            HandshakeToken::SetupFailed => {
                let mut message = Vec::new();
                let _ = self
                    .stream
                    .read_to_end(&mut message)
                    .await
                    .map_err(|e| StagehandError::sync("waiting for pause", e))?;
                Err(StagehandError::sync(
                    "waiting for pause",
                    format!(
                        "container process failed during setup: {}",
                        String::from_utf8_lossy(&message)
                    ),
                ))
            }
            other => Err(StagehandError::sync(
                "waiting for pause",
                format!("unexpected {other:?}"),
            )),
        }
    }

    /// Releases the runner.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error if the write fails.
    pub async fn release(&mut self) -> Result<()> {
        self.stream
            .write_all(&[HandshakeToken::ResumeAck.as_byte()])
            .await
            .map_err(|e| StagehandError::sync("sending start ack", e))
    }

    /// Waits for the runner to exec, which closes its end of the channel.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error if the read fails or any byte
    /// arrives before end-of-stream.
    pub async fn await_exec(&mut self) -> Result<()> {
        let mut byte = [0_u8; 1];
        match self.stream.read(&mut byte).await {
            Ok(0) => Ok(()),
            Ok(_) => Err(StagehandError::sync(
                "waiting for exec",
                "container process reported a startup failure",
            )),
            Err(e) => Err(StagehandError::sync("waiting for exec", e)),
        }
    }
}
