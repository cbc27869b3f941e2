//! Lifecycle hook execution.
//!
//! Hooks follow OCI semantics: the executable at `path` runs with `args`
//! (argv0 included) and `env`, receives the container state as JSON on
//! stdin, and fails on a non-zero exit status or when it outlives its
//! `timeout`.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::{Hook, HookStage};
use stagehand_common::types::StateSnapshot;

/// Runs a hook synchronously against a state snapshot.
pub trait HookExecutor: Send + Sync {
    /// Runs `hook` and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns a hook error if the hook cannot be started, fails, or times
    /// out.
    fn run(&self, stage: HookStage, hook: &Hook, state: &StateSnapshot) -> Result<()>;
}

/// Runs hooks as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandHooks;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl HookExecutor for CommandHooks {
    fn run(&self, stage: HookStage, hook: &Hook, state: &StateSnapshot) -> Result<()> {
        let fail = |message: String| StagehandError::Hook {
            stage: stage.as_str(),
            path: hook.path.clone(),
            message,
        };

        let mut command = Command::new(&hook.path);
        if let Some((argv0, rest)) = hook.args.split_first() {
            let _ = command.arg0(argv0).args(rest);
        }
        let _ = command
            .env_clear()
            .envs(hook.env.iter().filter_map(|e| e.split_once('=')))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let payload = serde_json::to_vec(state)?;

        tracing::debug!(stage = stage.as_str(), path = %hook.path.display(), "running hook");
        let mut child = command.spawn().map_err(|e| fail(e.to_string()))?;

        // A hook that never reads its stdin must not stall the timeout.
        if let Some(mut stdin) = child.stdin.take() {
            drop(std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&payload) {
                    tracing::debug!(error = %e, "hook did not read its state");
                }
            }));
        }

        let status = match hook.timeout {
            Some(secs) => wait_with_timeout(&mut child, Duration::from_secs(secs))
                .map_err(|e| fail(e.to_string()))?
                .ok_or_else(|| fail(format!("timed out after {secs}s")))?,
            None => child.wait().map_err(|e| fail(e.to_string()))?,
        };

        if !status.success() {
            return Err(fail(format!("exited with {status}")));
        }
        Ok(())
    }
}

/// Waits for `child` up to `limit`, killing it when the limit passes.
///
/// Returns `None` on timeout.
fn wait_with_timeout(
    child: &mut std::process::Child,
    limit: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
