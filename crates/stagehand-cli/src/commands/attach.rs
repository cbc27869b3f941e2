//! `stagehand attach`: Connect this terminal to a container's attach socket.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use stagehand_common::config::RuntimeConfig;
use stagehand_common::error::StagehandError;
use stagehand_common::types::ContainerId;
use stagehand_runtime::instance::{self, InstanceDir, InstanceLocator};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container ID, or a path to an attach socket.
    pub target: String,
}

/// Executes the `attach` command.
///
/// Relays stdin to the container and its output to stdout until the
/// container side closes the connection.
///
/// # Errors
///
/// Returns an error if the socket cannot be reached or the relay fails.
pub fn execute(args: &AttachArgs, config: &RuntimeConfig) -> anyhow::Result<ExitCode> {
    let socket = socket_for(&args.target, config)?;
    if !args.target.contains('/') && !socket.exists() {
        return Err(StagehandError::NotFound {
            kind: "container",
            id: args.target.clone(),
        }
        .into());
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building attach runtime")?;

    let result = runtime.block_on(relay(&socket, tokio::io::stdin(), tokio::io::stdout()));
    // The stdin reader blocks in a worker thread until the next line.
    runtime.shutdown_background();
    result?;
    Ok(ExitCode::SUCCESS)
}

/// Resolves a target to a socket path. Anything containing a `/` is taken
/// as a path, everything else as a container ID.
fn socket_for(target: &str, config: &RuntimeConfig) -> anyhow::Result<PathBuf> {
    if target.contains('/') {
        return Ok(PathBuf::from(target));
    }
    let id = ContainerId::parse(target)?;
    let instance_file = InstanceDir::new(config.data_dir.clone()).instance_file(&id);
    Ok(instance::attach_socket_path(&instance_file, &id))
}

async fn relay<I, O>(socket: &Path, mut input: I, mut output: O) -> anyhow::Result<()>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Unpin,
{
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    tracing::debug!(socket = %socket.display(), "attached");
    let (mut from_container, mut to_container) = stream.into_split();

    let sender = tokio::spawn(async move {
        let sent = tokio::io::copy(&mut input, &mut to_container).await?;
        to_container.shutdown().await?;
        Ok::<u64, std::io::Error>(sent)
    });

    let received = tokio::io::copy(&mut from_container, &mut output)
        .await
        .context("relaying container output")?;
    output.flush().await.context("flushing output")?;
    sender.abort();

    tracing::debug!(received, "attach session closed");
    Ok(())
}
