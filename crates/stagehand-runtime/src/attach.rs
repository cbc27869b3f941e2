//! Attach service: exposes a process's primary stream on a Unix socket.
//!
//! The first client to connect starts a single pump that copies the
//! process output into a [`StreamBroadcaster`]; later clients are added
//! to that broadcaster and see output from the moment they join. Every
//! client's input is copied straight into the process input, so input from
//! several clients interleaves in whatever order the transport delivers it.
//!
//! At most `limit` clients are ever wired into a session. Further
//! connections are accepted and closed right away with a warning; slots
//! are not reclaimed when a client leaves.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use stagehand_common::error::{Result, StagehandError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::broadcast::{self, Destination, SharedWriter, StreamBroadcaster};

/// Creates a listening socket at `path`, creating its parent directory.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an attach error if the directory cannot be created or the path
/// is already taken.
pub fn create_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StagehandError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let listener = UnixListener::bind(path).map_err(|e| StagehandError::Attach {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "attach socket bound");
    Ok(listener)
}

/// The process side of an attach session.
pub struct PrimaryStream {
    /// Process output, read by the pump.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Process input, written by client forwarders.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

impl PrimaryStream {
    /// Uses one descriptor (a pseudo-terminal master) for both directions.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let reader = File::from(fd);
        let writer = reader.try_clone()?;
        Ok(Self {
            output: Box::new(tokio::fs::File::from_std(reader)),
            input: Box::new(tokio::fs::File::from_std(writer)),
        })
    }

    /// Uses the controller's standard input for both directions.
    ///
    /// # Errors
    ///
    /// Returns an error if standard input cannot be duplicated.
    pub fn from_stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Self::from_fd(fd)
    }
}

impl std::fmt::Debug for PrimaryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryStream").finish_non_exhaustive()
    }
}

/// A bound attach socket and its session settings.
pub struct AttachSession {
    listener: UnixListener,
    path: PathBuf,
    limit: usize,
    tee: Option<SharedWriter>,
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("path", &self.path)
            .field("limit", &self.limit)
            .field("tee", &self.tee.is_some())
            .finish_non_exhaustive()
    }
}

impl AttachSession {
    /// Binds a session at `path`.
    ///
    /// # Errors
    ///
    /// Returns an attach error if the socket cannot be created.
    pub fn bind(path: &Path, limit: usize) -> Result<Self> {
        let listener = create_socket(path)?;
        Ok(Self::from_listener(listener, path.to_path_buf(), limit))
    }

    /// Wraps an already bound listener.
    #[must_use]
    pub const fn from_listener(listener: UnixListener, path: PathBuf, limit: usize) -> Self {
        Self {
            listener,
            path,
            limit,
            tee: None,
        }
    }

    /// Duplicates all process output into `tee`, in addition to clients.
    #[must_use]
    pub fn with_tee(mut self, tee: SharedWriter) -> Self {
        self.tee = Some(tee);
        self
    }

    /// Returns the socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts clients until the listener fails.
    ///
    /// Per-client failures only close that client. The socket file is
    /// removed when the session ends.
    ///
    /// # Errors
    ///
    /// Returns an attach error when `accept(2)` fails; the session is
    /// unusable after that.
    pub async fn serve<R, W>(self, output: R, input: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let _cleanup = SocketFile(self.path.clone());
        let input = Arc::new(Mutex::new(input));
        let broadcaster = StreamBroadcaster::new();
        let mut output = Some(output);
        let mut wired = 0_usize;

        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| StagehandError::Attach {
                    path: self.path.clone(),
                    source: e,
                })?;

            if wired == self.limit {
                tracing::warn!(limit = self.limit, "attach client limit reached, closing connection");
                drop(stream);
                continue;
            }
            wired += 1;
            let client = wired;
            tracing::info!(client, path = %self.path.display(), "attach client connected");

            let (read_half, write_half) = stream.into_split();
            let writer = ClientWriter {
                inner: Some(write_half),
                client,
            };
            broadcaster
                .add(Destination::Writer(broadcast::shared(writer)))
                .await;

            if let Some(output) = output.take() {
                let broadcaster = broadcaster.clone();
                let tee = self.tee.clone();
                drop(tokio::spawn(async move {
                    match broadcast::pump(output, broadcaster, tee).await {
                        Ok(bytes) => tracing::debug!(bytes, "process output closed"),
                        Err(e) => tracing::debug!(error = %e, "process output pump stopped"),
                    }
                }));
            }

            drop(tokio::spawn(forward_input(read_half, Arc::clone(&input), client)));
        }
    }
}

/// Copies one client's bytes into the process input until the client
/// stops sending. The client keeps receiving output after that.
async fn forward_input<W>(mut client_input: OwnedReadHalf, process_input: Arc<Mutex<W>>, client: usize)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0_u8; 4096];
    loop {
        let n = match client_input.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(client, error = %e, "attach client read failed");
                break;
            }
        };
        let mut input = process_input.lock().await;
        if let Err(e) = input.write_all(&buf[..n]).await {
            tracing::warn!(client, error = %e, "writing client input to process failed");
            break;
        }
    }
    tracing::debug!(client, "attach client input closed");
}

/// Broadcast destination for one client.
///
/// The first failed write detaches the client; later writes are
/// swallowed so a departed client never fails a broadcast to the others.
struct ClientWriter {
    inner: Option<OwnedWriteHalf>,
    client: usize,
}

impl ClientWriter {
    fn detach(&mut self, reason: &dyn std::fmt::Display) {
        if self.inner.take().is_some() {
            tracing::info!(client = self.client, %reason, "attach client disconnected");
        }
    }
}

impl AsyncWrite for ClientWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(buf.len()));
        };
        match Pin::new(inner).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => {
                this.detach(&e);
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Ok(0)) if !buf.is_empty() => {
                this.detach(&"zero-length write");
                Poll::Ready(Ok(buf.len()))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Removes the socket file when the session ends.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
