//! CLI command implementations
//!
//! Kept out of main.rs so argument resolution and exit-status mapping can be
//! unit tested.

use abr_scenarios::{Presets, ScenarioDescriptor};
use abr_testbench::{HarnessConfig, NetnsSubstrate, Orchestrator, ScenarioReport};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::info;

/// Print the preset table
pub fn cmd_list() {
    println!("Preset scenarios:");
    println!("=================");
    for (i, scenario) in Presets::all().iter().enumerate() {
        println!(
            "  {:>2}  {:<12} {:>5}s  {}",
            i + 1,
            scenario.name,
            scenario.timeout.as_secs(),
            scenario.description
        );
    }
}

/// Run one scenario against network namespaces and map the report to an exit status
pub async fn cmd_run(scenario: ScenarioDescriptor, config: HarnessConfig) -> Result<ExitCode> {
    info!("Running scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let substrate = NetnsSubstrate::new(&config);
    let orchestrator = Orchestrator::new(substrate, config);
    info!("Work dir: {}", orchestrator.config().work_dir.display());
    let report = orchestrator
        .run(&scenario)
        .await
        .with_context(|| format!("scenario '{}' rejected", scenario.name))?;

    report.log_summary();
    Ok(ExitCode::from(exit_status(&report)))
}

/// 0 for a natural exit or timeout, 1 for a forward-path failure.
/// Teardown errors are logged by `log_summary` and leave the status alone.
pub fn exit_status(report: &ScenarioReport) -> u8 {
    if report.is_success() {
        0
    } else {
        1
    }
}

/// Load the harness config, defaulting the work dir to the current directory
pub fn resolve_config(config: Option<&Path>, work_dir: Option<&Path>) -> Result<HarnessConfig> {
    let mut harness = match config {
        Some(path) => HarnessConfig::from_json_file(path)?,
        None => HarnessConfig::new(
            std::env::current_dir().context("cannot determine current directory")?,
        ),
    };
    if let Some(dir) = work_dir {
        harness.work_dir = dir.to_path_buf();
    }
    Ok(harness.finalize()?)
}

/// Pick the preset at `index` or load a descriptor file
pub fn resolve_scenario(index: Option<u8>, file: Option<&Path>) -> Result<ScenarioDescriptor> {
    match (index, file) {
        (_, Some(path)) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read scenario file {}", path.display()))?;
            ScenarioDescriptor::from_json(&json)
                .with_context(|| format!("invalid scenario file {}", path.display()))
        }
        (Some(index), None) => Ok(Presets::by_index(usize::from(index))?),
        (None, None) => anyhow::bail!("no scenario selected"),
    }
}
