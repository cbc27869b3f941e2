//! CLI command definitions and dispatch.

pub mod attach;
pub mod start;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use stagehand_common::config::RuntimeConfig;

/// Stagehand: container process launcher with attachable streams.
#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding instance metadata, state and attach sockets.
    #[arg(long, global = true, env = "STAGEHAND_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

impl Cli {
    /// Runtime configuration with command-line overrides applied.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        match &self.data_dir {
            Some(dir) => RuntimeConfig::with_data_dir(dir.clone()),
            None => RuntimeConfig::default(),
        }
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch a container process from a JSON spec and wait for it.
    Start(start::StartArgs),
    /// Connect this terminal to a running container.
    Attach(attach::AttachArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.config();
    match cli.command {
        Command::Start(args) => start::execute(args, config),
        Command::Attach(args) => attach::execute(&args, &config),
    }
}
