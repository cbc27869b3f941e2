//! Process creation glue: forks the container process, runs the runner in
//! the child and the controller in the parent.
//!
//! The parent builds its Tokio runtime only after the fork, so the child
//! never inherits runtime threads.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use stagehand_common::config::RuntimeConfig;
use stagehand_common::constants::RUNNER_FAILURE_EXIT;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::{ContainerSpec, PtyPair};
use stagehand_common::types::ContainerId;
use stagehand_core::security::{NoNewPrivileges, SecurityPolicy};

use crate::attach::PrimaryStream;
use crate::controller::Controller;
use crate::handshake::{ControllerChannel, RunnerChannel};
use crate::hooks::{CommandHooks, HookExecutor};
use crate::runner::ChildRunner;

/// How the container process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

/// Builder for launching one container.
pub struct Launcher {
    id: ContainerId,
    bundle: PathBuf,
    config: RuntimeConfig,
    empty_process: bool,
    capture_output: bool,
    policy: Box<dyn SecurityPolicy>,
    hooks: Arc<dyn HookExecutor>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("id", &self.id)
            .field("bundle", &self.bundle)
            .field("empty_process", &self.empty_process)
            .finish_non_exhaustive()
    }
}

impl Launcher {
    /// Creates a launcher for container `id`.
    #[must_use]
    pub fn new(id: ContainerId, config: RuntimeConfig) -> Self {
        Self {
            id,
            bundle: PathBuf::from("/"),
            config,
            empty_process: false,
            capture_output: false,
            policy: Box::new(NoNewPrivileges),
            hooks: Arc::new(CommandHooks),
        }
    }

    /// Sets the bundle directory published in the container state.
    #[must_use]
    pub fn bundle(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.bundle = bundle.into();
        self
    }

    /// Holds the namespaces without running the process's command.
    #[must_use]
    pub const fn empty_process(mut self, enabled: bool) -> Self {
        self.empty_process = enabled;
        self
    }

    /// Writes all process output to the instance log file.
    #[must_use]
    pub const fn capture_output(mut self, enabled: bool) -> Self {
        self.capture_output = enabled;
        self
    }

    /// Replaces the security policy applied before exec.
    #[must_use]
    pub fn policy(mut self, policy: Box<dyn SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the hook executor.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn HookExecutor>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Starts the container and blocks until its process exits.
    ///
    /// On any failure after the fork the container process is killed and
    /// reaped, and a published state is rewritten as `stopped`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an id that cannot name an
    /// instance directory. Returns an error if the terminal, socket pair
    /// or fork cannot be created, if startup fails on either side, or if
    /// the attach service stops accepting clients while the container
    /// runs. A failure inside the container process before it paused
    /// arrives as a synchronization error carrying the runner's message.
    pub fn launch(self, mut spec: ContainerSpec) -> Result<ExitOutcome> {
        self.id.validate()?;
        spec.process.validate()?;

        let pty = if spec.process.terminal {
            let pty = nix::pty::openpty(None, None).map_err(|e| StagehandError::Terminal {
                step: "openpty",
                source: e.into(),
            })?;
            Some((pty.master, pty.slave))
        } else {
            None
        };
        spec.process.pty = pty.as_ref().map(|(master, slave)| PtyPair {
            master: master.as_raw_fd(),
            slave: slave.as_raw_fd(),
        });

        let (runner_end, controller_end) = UnixStream::pair()
            .map_err(|e| StagehandError::sync("creating handshake channel", e))?;

        // SAFETY: the child only runs the runner, which ends in exec or _exit.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(controller_end);
                if let Some((master, slave)) = pty {
                    // Closed by the runner when it adopts the terminal.
                    let _ = master.into_raw_fd();
                    let _ = slave.into_raw_fd();
                }
                self.run_child(&spec, runner_end)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(runner_end);
                let master = pty.map(|(master, slave)| {
                    drop(slave);
                    master
                });
                self.run_parent(spec, child, controller_end, master)
            }
            Err(e) => Err(StagehandError::sync("forking container process", e)),
        }
    }

    fn run_child(&self, spec: &ContainerSpec, channel: UnixStream) -> ! {
        // SAFETY: restoring the default disposition installs no handler.
        // The Rust runtime ignores SIGPIPE and exec would carry that over.
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
            tracing::warn!(error = %e, "failed to restore SIGPIPE disposition");
        }
        let runner = ChildRunner::new(&spec.process, self.policy.as_ref());
        let channel = RunnerChannel::new(channel);
        let result = if self.empty_process {
            runner.hold(channel)
        } else {
            match runner.exec(channel) {
                Ok(never) => match never {},
                Err(e) => Err(e),
            }
        };
        let code = match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "container process startup failed");
                RUNNER_FAILURE_EXIT
            }
        };
        // SAFETY: _exit skips the parent's atexit handlers, which the forked
        // child must not run.
        unsafe { libc::_exit(code) }
    }

    fn run_parent(
        self,
        spec: ContainerSpec,
        child: Pid,
        channel: UnixStream,
        master: Option<OwnedFd>,
    ) -> Result<ExitOutcome> {
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                terminate(child);
                return Err(StagehandError::config(format!("controller runtime: {e}")));
            }
        };

        let result = runtime.block_on(async move {
            let mut controller = Controller::new(self.id, spec, self.bundle, &self.config)
                .with_hooks(self.hooks)
                .capture_output(self.capture_output);

            let result = supervise(&mut controller, child, channel, master).await;
            if result.is_err() {
                terminate(child);
            }
            match controller.mark_stopped() {
                Err(e) if result.is_ok() => Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to record stopped state");
                    result
                }
                Ok(()) => result,
            }
        });
        // Blocking reads on the primary stream may never return.
        runtime.shutdown_background();
        result
    }
}

/// Drives the container from the handshake until its process exits.
async fn supervise(
    controller: &mut Controller,
    child: Pid,
    channel: UnixStream,
    master: Option<OwnedFd>,
) -> Result<ExitOutcome> {
    channel
        .set_nonblocking(true)
        .map_err(|e| StagehandError::sync("preparing handshake channel", e))?;
    let stream = tokio::net::UnixStream::from_std(channel)
        .map_err(|e| StagehandError::sync("preparing handshake channel", e))?;
    let mut channel = ControllerChannel::new(stream);

    let primary = match master {
        Some(fd) => PrimaryStream::from_fd(fd),
        None => PrimaryStream::from_stdin(),
    }
    .map_err(|e| StagehandError::Terminal {
        step: "opening primary stream",
        source: e,
    })?;

    controller.pre_start(child, &mut channel, primary).await?;
    drop(channel);
    controller.post_start().await?;

    let outcome = wait_for_exit(child, controller.take_attach_task()).await?;
    tracing::info!(%child, ?outcome, "container process exited");
    Ok(outcome)
}

/// Kills and reaps a container process whose startup failed.
fn terminate(child: Pid) {
    if let Err(e) = kill(child, Signal::SIGKILL) {
        tracing::debug!(%child, error = %e, "container process already gone");
    }
    if let Err(e) = waitpid(child, None) {
        tracing::debug!(%child, error = %e, "failed to reap container process");
    }
}

/// Waits for the container process, failing early if the attach service
/// dies first.
async fn wait_for_exit(
    child: Pid,
    attach: Option<crate::controller::AttachTask>,
) -> Result<ExitOutcome> {
    let mut exit = tokio::task::spawn_blocking(move || wait_child(child));

    let attach_failed = async {
        match attach {
            Some(task) => match task.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => std::future::pending().await,
                Err(e) => StagehandError::sync("running attach service", e),
            },
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = &mut exit => status.map_err(|e| StagehandError::sync("waiting for container", e))?,
        e = attach_failed => {
            tracing::error!(error = %e, "attach service failed");
            Err(e)
        }
    }
}

fn wait_child(child: Pid) -> Result<ExitOutcome> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitOutcome::Signaled(signal)),
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(StagehandError::sync("waiting for container", e)),
        }
    }
}
