//! Scenario definitions for the adaptive-bitrate proxy testbench
//!
//! This crate provides the pure data model the testbench runs against:
//! parameterised topology shapes, timed scenario descriptors, command
//! templates, and the preset scenarios used for regression runs. Nothing
//! here touches the network or spawns processes; the `abr-testbench` crate
//! owns all side effects.

pub mod builder;
pub mod link;
pub mod presets;
pub mod scenario;
pub mod schedule;
pub mod template;
pub mod topology;

pub use builder::ScenarioBuilder;
pub use link::{LinkShaping, TokenBucket};
pub use presets::Presets;
pub use scenario::{ProxyParams, ScenarioDescriptor};
pub use schedule::{Action, TimedEvent};
pub use template::{CommandTemplate, RenderContext};
pub use topology::{Endpoint, Host, Link, Role, Switch, Topology, TopologySpec};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid scenario JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScenarioError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ScenarioError::InvalidParameter(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ScenarioError>;
