//! Code that runs inside the container's entry process.
//!
//! ```text
//! Configuring -> AwaitingPause -> AwaitingResume -> SecuringEnv -> Execing
//!                                              \
//!                                               -> SecuringEnv -> SignalLoop   (empty process)
//! ```
//!
//! Nothing the user asked to run executes before the controller has
//! released the process, and the security policy is applied between the
//! release and exec with no suspension point in between.

use std::convert::Infallible;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::ProcessSpec;
use stagehand_core::security::SecurityPolicy;
use stagehand_core::{exec, rlimit, terminal};

use crate::handshake::RunnerChannel;
use crate::signals::TerminationWatch;

/// Configures, synchronizes, secures and finally replaces the container
/// process.
pub struct ChildRunner<'a> {
    process: &'a ProcessSpec,
    policy: &'a dyn SecurityPolicy,
}

impl<'a> ChildRunner<'a> {
    /// Creates a runner for `process` that applies `policy` before exec.
    pub const fn new(process: &'a ProcessSpec, policy: &'a dyn SecurityPolicy) -> Self {
        Self { process, policy }
    }

    /// Runs the normal path and replaces the process image.
    ///
    /// Only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, synchronization, policy or exec
    /// error. Failures after the release are also reported to the
    /// controller over the channel.
    pub fn exec<S: Read + Write>(&self, mut channel: RunnerChannel<S>) -> Result<Infallible> {
        let (program, args) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                channel.report_setup_failure(&e);
                return Err(e);
            }
        };

        channel.notify_pause()?;
        channel.await_resume()?;

        if let Err(e) = self.policy.apply(self.process) {
            channel.signal_abort();
            return Err(e);
        }

        match exec::replace_image(&program, &args, &self.process.env) {
            Ok(never) => match never {},
            Err(e) => {
                channel.signal_abort();
                Err(e)
            }
        }
    }

    /// Runs the empty-process path: same handshake, then hold the
    /// container's namespaces and reap children until interrupted.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, synchronization or policy error.
    pub fn hold<S: Read + Write>(&self, mut channel: RunnerChannel<S>) -> Result<()> {
        if let Err(e) = self.configure() {
            channel.report_setup_failure(&e);
            return Err(e);
        }

        channel.notify_pause()?;
        channel.await_resume()?;

        if let Err(e) = self.policy.apply(self.process) {
            channel.signal_abort();
            return Err(e);
        }
        let watch = match TerminationWatch::install() {
            Ok(watch) => watch,
            Err(e) => {
                channel.signal_abort();
                return Err(e);
            }
        };
        drop(channel.into_inner());

        watch.wait();
        Ok(())
    }

    /// Configures the process and resolves the program, returning it with
    /// the argument vector to exec.
    fn prepare(&self) -> Result<(PathBuf, Vec<String>)> {
        self.process.validate()?;
        let cwd = self.configure()?;
        if let Some(pty) = self.process.pty {
            terminal::adopt_terminal(pty)?;
        }

        let program =
            exec::resolve_program(&self.process.args[0], self.process.path_override(), &cwd)?;
        let mut args = self.process.args.clone();
        args[0] = program.to_string_lossy().into_owned();
        Ok((program, args))
    }

    /// Enters the working directory and applies resource limits.
    fn configure(&self) -> Result<PathBuf> {
        let cwd = if self.process.cwd.as_os_str().is_empty() {
            Path::new("/")
        } else {
            self.process.cwd.as_path()
        };
        if !cwd.is_absolute() {
            return Err(StagehandError::config(format!(
                "cwd property must be an absolute path, got {}",
                cwd.display()
            )));
        }
        std::env::set_current_dir(cwd).map_err(|e| {
            StagehandError::config(format!(
                "can't enter working directory {}: {e}",
                cwd.display()
            ))
        })?;

        rlimit::apply_rlimits(&self.process.rlimits)?;
        tracing::debug!(cwd = %cwd.display(), limits = self.process.rlimits.len(), "process configured");
        Ok(cwd.to_path_buf())
    }
}
