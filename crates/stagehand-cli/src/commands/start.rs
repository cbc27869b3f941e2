//! `stagehand start`: Launch a container process and wait for it to exit.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use stagehand_common::config::RuntimeConfig;
use stagehand_common::oci::ContainerSpec;
use stagehand_common::types::ContainerId;
use stagehand_runtime::launcher::{ExitOutcome, Launcher};

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Path to the container spec (OCI `config.json` subset).
    #[arg(default_value = "config.json")]
    pub spec: PathBuf,

    /// Container identifier. A random one is generated when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Bundle directory recorded in the container state. Defaults to the
    /// directory holding the container spec.
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Hold the container without running its command.
    #[arg(long)]
    pub empty_process: bool,

    /// Also write the process output to `<id>.log` in the instance directory.
    #[arg(long)]
    pub capture_output: bool,

    /// Maximum number of attach clients wired into the session.
    #[arg(long)]
    pub attach_limit: Option<usize>,
}

/// Executes the `start` command.
///
/// Blocks until the container process exits and mirrors its exit status.
///
/// # Errors
///
/// Returns an error if the container spec cannot be loaded or the container fails to
/// start.
pub fn execute(args: StartArgs, mut config: RuntimeConfig) -> anyhow::Result<ExitCode> {
    let spec = ContainerSpec::load(&args.spec)
        .with_context(|| format!("loading container spec {}", args.spec.display()))?;
    if let Some(limit) = args.attach_limit {
        config.attach_client_limit = limit;
    }

    let id = match args.id {
        Some(id) => ContainerId::parse(id)?,
        None => ContainerId::generate(),
    };
    let bundle = args.bundle.unwrap_or_else(|| bundle_of(&args.spec));
    tracing::info!(%id, bundle = %bundle.display(), "starting container");

    let outcome = Launcher::new(id.clone(), config)
        .bundle(bundle)
        .empty_process(args.empty_process)
        .capture_output(args.capture_output)
        .launch(spec)
        .with_context(|| format!("starting container {id}"))?;

    Ok(exit_code(outcome))
}

fn bundle_of(spec: &Path) -> PathBuf {
    match spec.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Shell convention: the low byte of the status, or 128 plus the signal.
fn exit_code(outcome: ExitOutcome) -> ExitCode {
    ExitCode::from(status_byte(outcome))
}

fn status_byte(outcome: ExitOutcome) -> u8 {
    let code = match outcome {
        ExitOutcome::Exited(code) => code,
        ExitOutcome::Signaled(signal) => 128 + signal as i32,
    };
    u8::try_from(code & 0xff).unwrap_or(u8::MAX)
}
