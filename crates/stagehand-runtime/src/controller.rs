//! Lifecycle orchestration on the privileged side.
//!
//! The controller observes the runner's pause notification, stops the
//! child, runs prestart hooks, publishes the attach socket, records the
//! `created` state, releases the child and waits for it to exec. Once the
//! handshake channel reaches end-of-stream it records `running` and runs
//! poststart hooks.

use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use stagehand_common::config::RuntimeConfig;
use stagehand_common::constants::ATTACH_SOCKET_ANNOTATION;
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::{ContainerSpec, Hook, HookStage};
use stagehand_common::types::{ContainerId, ContainerState, StateSnapshot};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::attach::{AttachSession, PrimaryStream};
use crate::broadcast;
use crate::handshake::ControllerChannel;
use crate::hooks::{CommandHooks, HookExecutor};
use crate::instance::{self, InstanceDir, InstanceLocator};
use crate::state::{JsonStateFile, StatePersister};

/// Handle to the attach accept loop.
pub type AttachTask = JoinHandle<Result<()>>;

/// Drives a container from pause notification to `running`.
pub struct Controller {
    spec: ContainerSpec,
    state: StateSnapshot,
    hooks: Arc<dyn HookExecutor>,
    persister: Arc<dyn StatePersister>,
    locator: Arc<dyn InstanceLocator>,
    attach_limit: usize,
    capture_output: bool,
    attach: Option<AttachTask>,
    published: bool,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("attach_limit", &self.attach_limit)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with the default collaborators: hooks run as
    /// child processes, instance metadata lives under the configured data
    /// directory, and state is written next to it.
    #[must_use]
    pub fn new(id: ContainerId, spec: ContainerSpec, bundle: PathBuf, config: &RuntimeConfig) -> Self {
        let locator = InstanceDir::new(config.data_dir.clone());
        let persister = JsonStateFile::for_instance(&locator.instance_file(&id));
        let mut state = StateSnapshot::new(id, bundle);
        state.annotations.extend(spec.annotations.clone());

        Self {
            spec,
            state,
            hooks: Arc::new(CommandHooks),
            persister: Arc::new(persister),
            locator: Arc::new(locator),
            attach_limit: config.attach_client_limit,
            capture_output: false,
            attach: None,
            published: false,
        }
    }

    /// Replaces the hook executor.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn HookExecutor>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replaces the state persister.
    #[must_use]
    pub fn with_persister(mut self, persister: Arc<dyn StatePersister>) -> Self {
        self.persister = persister;
        self
    }

    /// Replaces the instance metadata locator.
    #[must_use]
    pub fn with_locator(mut self, locator: Arc<dyn InstanceLocator>) -> Self {
        self.locator = locator;
        self
    }

    /// Also writes all process output to `<id>.log` next to the instance
    /// file.
    #[must_use]
    pub const fn capture_output(mut self, enabled: bool) -> Self {
        self.capture_output = enabled;
        self
    }

    /// Returns the current state snapshot.
    #[must_use]
    pub const fn state(&self) -> &StateSnapshot {
        &self.state
    }

    /// Takes the handle of the attach accept loop, once started.
    pub fn take_attach_task(&mut self) -> Option<AttachTask> {
        self.attach.take()
    }

    /// Runs everything between the child's pause notification and its
    /// exec.
    ///
    /// # Errors
    ///
    /// Returns a synchronization error if the handshake is violated, a
    /// hook error if a prestart hook fails, an attach error if the socket
    /// cannot be created, or a persistence error.
    pub async fn pre_start<S>(
        &mut self,
        pid: Pid,
        channel: &mut ControllerChannel<S>,
        primary: PrimaryStream,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        channel.await_pause().await?;
        self.state.pid = Some(pid.as_raw());

        if let Err(e) = kill(pid, Signal::SIGSTOP) {
            tracing::warn!(%pid, error = %e, "failed to stop container process");
        }

        for hook in self.spec.hooks.prestart.clone() {
            self.run_hook(HookStage::Prestart, hook).await?;
        }

        let instance_file = self.locator.instance_file(&self.state.id);
        let socket = instance::attach_socket_path(&instance_file, &self.state.id);
        let _ = self.state.annotations.insert(
            ATTACH_SOCKET_ANNOTATION.to_string(),
            socket.display().to_string(),
        );

        let mut session = AttachSession::bind(&socket, self.attach_limit)?;
        if self.capture_output {
            let path = instance::log_path(&instance_file, &self.state.id);
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| StagehandError::Io { path, source: e })?;
            session = session.with_tee(broadcast::shared(file));
        }

        self.persist(ContainerState::Created)?;

        let PrimaryStream { output, input } = primary;
        self.attach = Some(tokio::spawn(session.serve(output, input)));
        tracing::info!(id = %self.state.id, socket = %socket.display(), "attach socket ready");

        channel.release().await?;
        if let Err(e) = kill(pid, Signal::SIGCONT) {
            tracing::warn!(%pid, error = %e, "failed to continue container process");
        }

        channel.await_exec().await
    }

    /// Records `running` and runs poststart hooks. Hook failures are
    /// logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state cannot be persisted.
    pub async fn post_start(&mut self) -> Result<()> {
        self.persist(ContainerState::Running)?;
        tracing::info!(id = %self.state.id, pid = ?self.state.pid, "container running");

        for hook in self.spec.hooks.poststart.clone() {
            if let Err(e) = self.run_hook(HookStage::Poststart, hook).await {
                tracing::warn!(error = %e, "poststart hook failed");
            }
        }
        Ok(())
    }

    /// Records `stopped` once the container process is gone, whether it
    /// ran or startup failed. Writes nothing if no state was ever
    /// published.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    pub fn mark_stopped(&mut self) -> Result<()> {
        if !self.published {
            tracing::debug!(id = %self.state.id, "no state published, nothing to stop");
            return Ok(());
        }
        self.persist(ContainerState::Stopped)
    }

    fn persist(&mut self, status: ContainerState) -> Result<()> {
        self.state.status = status;
        self.persister.persist(&self.state)?;
        self.published = true;
        tracing::debug!(id = %self.state.id, %status, "state persisted");
        Ok(())
    }

    async fn run_hook(&self, stage: HookStage, hook: Hook) -> Result<()> {
        let executor = Arc::clone(&self.hooks);
        let state = self.state.clone();
        let path = hook.path.clone();
        tokio::task::spawn_blocking(move || executor.run(stage, &hook, &state))
            .await
            .map_err(|e| StagehandError::Hook {
                stage: stage.as_str(),
                path,
                message: e.to_string(),
            })?
    }
}
