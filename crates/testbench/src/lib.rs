//! Scenario testbench for adaptive-bitrate proxies
//!
//! This crate runs `abr_scenarios::ScenarioDescriptor`s end to end: it asks an
//! emulation substrate for a fresh network, publishes the server addresses
//! through an endpoint registry file, launches role processes, fires timed
//! link-rate changes while the proxy under test runs, and tears everything
//! down again whatever happened on the way.
//!
//! Two substrates are provided: `NetnsSubstrate` builds the topology out of
//! Linux network namespaces, bridges and veth pairs shaped with `tc`, and
//! `SimSubstrate` simulates hosts and processes in memory for tests.

pub mod config;
pub mod netns;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod shaping;
pub mod sim;
pub mod substrate;

pub use abr_scenarios::{Presets, ScenarioDescriptor};
pub use config::HarnessConfig;
pub use netns::NetnsSubstrate;
pub use orchestrator::{Orchestrator, RunOutcome, ScenarioReport};
pub use registry::EndpointRegistry;
pub use schedule::{ScheduleSummary, Scheduler};
pub use sim::{Lifetime, SimBehavior, SimCall, SimRecord, SimSubstrate};
pub use substrate::{
    CommandOutput, HostHandle, ProcessExit, ProcessHandle, RunningNetwork, Substrate,
};

use abr_scenarios::ScenarioError;
use thiserror::Error;

/// Errors reported by an emulation substrate
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Unknown host '{0}'")]
    UnknownHost(String),

    #[error("Unsupported topology: {0}")]
    Unsupported(String),

    #[error("Simulated failure: {0}")]
    Simulated(String),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("Teardown incomplete: {}", .0.join("; "))]
    Incomplete(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal errors of a scenario run
#[derive(Error, Debug)]
pub enum TestbenchError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(#[from] ScenarioError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network build failed: {0}")]
    NetworkBuild(#[source] SubstrateError),

    #[error("Endpoint registry I/O failed: {0}")]
    RegistryIo(#[source] std::io::Error),

    #[error("Launch failed on {host}: {message}")]
    Launch { host: String, message: String },

    #[error("Lost track of the proxy under test: {0}")]
    Run(#[source] SubstrateError),

    #[error("Scenario step panicked: {0}")]
    Panicked(String),
}

/// A cleanup action that failed during teardown
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage}: {message}")]
pub struct TeardownError {
    pub stage: &'static str,
    pub message: String,
}

impl TeardownError {
    pub fn new(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}
