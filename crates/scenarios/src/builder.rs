//! Builder pattern for creating custom scenarios
//!
//! This module provides ScenarioBuilder for constructing ScenarioDescriptor
//! instances with a fluent API. `build` validates the result.

use crate::scenario::{ProxyParams, ScenarioDescriptor};
use crate::schedule::TimedEvent;
use crate::topology::{Role, TopologySpec};
use crate::{Result, ScenarioError};
use std::path::PathBuf;
use std::time::Duration;

pub struct ScenarioBuilder {
    name: String,
    description: String,
    topology: Option<TopologySpec>,
    proxy: ProxyParams,
    servers: Vec<String>,
    timeout: Option<Duration>,
    events: Vec<TimedEvent>,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            topology: None,
            proxy: ProxyParams {
                listen_port: 8888,
                alpha: 0.5,
                log_path: PathBuf::from("proxy.log"),
            },
            servers: Vec::new(),
            timeout: None,
            events: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn topology(mut self, topology: TopologySpec) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.proxy.listen_port = port;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.proxy.alpha = alpha;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy.log_path = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Publish a host's address through the endpoint registry
    pub fn registry_server(mut self, host: impl Into<String>) -> Self {
        self.servers.push(host.into());
        self
    }

    pub fn event(mut self, event: TimedEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Start a server role at `after`, published through the registry
    pub fn server(self, after: Duration, host: &str, command: &str, stop: Option<&str>) -> Self {
        let mut event = TimedEvent::start_role(after, host, Role::Server, command);
        if let Some(stop) = stop {
            event = event.with_stop(stop);
        }
        self.registry_server(host).event(event)
    }

    pub fn client(self, after: Duration, host: &str, command: &str) -> Self {
        self.event(TimedEvent::start_role(after, host, Role::Client, command))
    }

    /// Start the proxy under test at offset 0; contract arguments are appended at launch
    pub fn proxy(self, host: &str, program: &str) -> Self {
        self.event(TimedEvent::start_role(
            Duration::ZERO,
            host,
            Role::ProxyUnderTest,
            program,
        ))
    }

    pub fn build(self) -> Result<ScenarioDescriptor> {
        let topology = self
            .topology
            .ok_or_else(|| ScenarioError::invalid(format!("scenario '{}' has no topology", self.name)))?;
        let timeout = self
            .timeout
            .ok_or_else(|| ScenarioError::invalid(format!("scenario '{}' has no timeout", self.name)))?;

        let descriptor = ScenarioDescriptor {
            name: self.name,
            description: self.description,
            topology,
            proxy: self.proxy,
            servers: self.servers,
            timeout,
            events: self.events,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
