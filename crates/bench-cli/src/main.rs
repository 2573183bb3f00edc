//! Adaptive-bitrate proxy testbench CLI
//!
//! Runs one of the preset regression scenarios (or a scenario loaded from a
//! JSON descriptor) against the Linux network-namespace substrate.

mod commands;

use clap::Parser;
use commands::{cmd_list, cmd_run, resolve_config, resolve_scenario};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Preset scenario to run (1-10)
    #[arg(
        required_unless_present_any = ["list", "scenario"],
        value_parser = clap::value_parser!(u8).range(1..=10)
    )]
    index: Option<u8>,

    /// List the preset scenarios and exit
    #[arg(long, conflicts_with_all = ["index", "scenario"])]
    list: bool,

    /// Scenario descriptor file (JSON) to run instead of a preset
    #[arg(long, conflicts_with = "index")]
    scenario: Option<PathBuf>,

    /// Harness configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for role processes, overrides the config
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.list {
        cmd_list();
        return ExitCode::SUCCESS;
    }

    let prepared = resolve_config(cli.config.as_deref(), cli.work_dir.as_deref()).and_then(
        |config| {
            resolve_scenario(cli.index, cli.scenario.as_deref()).map(|scenario| (config, scenario))
        },
    );
    let (config, scenario) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match cmd_run(scenario, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
