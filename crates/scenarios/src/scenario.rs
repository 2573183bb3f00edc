//! Scenario descriptors
//!
//! A `ScenarioDescriptor` is everything the orchestrator needs for one run:
//! which topology to build, how to invoke the proxy under test, which
//! servers to publish through the endpoint registry, the timeout, and the
//! ordered list of timed events.

use crate::schedule::{Action, TimedEvent};
use crate::topology::{Role, Topology, TopologySpec};
use crate::{Result, ScenarioError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Parameters handed to the proxy under test, in invocation order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyParams {
    pub listen_port: u16,
    /// Throughput smoothing factor, in [0, 1]
    pub alpha: f64,
    /// Relative paths resolve against the harness work dir
    pub log_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub topology: TopologySpec,
    pub proxy: ProxyParams,
    /// Hosts whose addresses are written to the endpoint registry, in order
    pub servers: Vec<String>,
    pub timeout: Duration,
    pub events: Vec<TimedEvent>,
}

impl ScenarioDescriptor {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The single event that starts the proxy under test
    pub fn proxy_event(&self) -> Option<&TimedEvent> {
        self.events.iter().find(|e| e.action.is_proxy_start())
    }

    /// Host running the proxy under test
    pub fn proxy_host(&self) -> Option<&str> {
        self.proxy_event().map(|e| e.action.host())
    }

    fn role_assignments(&self) -> impl Iterator<Item = (&str, Role)> {
        self.events.iter().filter_map(|e| match &e.action {
            Action::StartRole { host, role, .. } => Some((host.as_str(), *role)),
            _ => None,
        })
    }

    /// Check the descriptor without side effects
    pub fn validate(&self) -> Result<()> {
        self.build_topology().map(|_| ())
    }

    /// Validate the descriptor and build its topology with roles assigned
    pub fn build_topology(&self) -> Result<Topology> {
        if self.timeout.is_zero() {
            return Err(ScenarioError::invalid("timeout must be positive"));
        }
        if self.proxy.listen_port == 0 {
            return Err(ScenarioError::invalid("proxy listen port must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.proxy.alpha) {
            return Err(ScenarioError::invalid(format!(
                "proxy tuning parameter must be in [0, 1], got {}",
                self.proxy.alpha
            )));
        }

        let topology = self.topology.build()?;

        for server in &self.servers {
            if !topology.contains_host(server) {
                return Err(ScenarioError::invalid(format!(
                    "server host '{}' is not part of topology '{}'",
                    server,
                    topology.name()
                )));
            }
        }

        let proxies: Vec<&TimedEvent> = self
            .events
            .iter()
            .filter(|e| e.action.is_proxy_start())
            .collect();
        match proxies.as_slice() {
            [proxy] if proxy.after.is_zero() => {}
            [proxy] => {
                return Err(ScenarioError::invalid(format!(
                    "proxy under test must start at offset 0, not {:?}",
                    proxy.after
                )))
            }
            [] => return Err(ScenarioError::invalid("no proxy-under-test role is started")),
            _ => {
                return Err(ScenarioError::invalid(
                    "more than one proxy-under-test role is started",
                ))
            }
        }

        let mut slots = HashSet::new();
        for (index, event) in self.events.iter().enumerate() {
            let host = event.action.host();
            if !topology.contains_host(host) {
                return Err(ScenarioError::invalid(format!(
                    "event {} targets unknown host '{}'",
                    index, host
                )));
            }

            match &event.action {
                Action::StartRole { command, stop, .. } => {
                    for template in std::iter::once(command).chain(stop.iter()) {
                        for referenced in template.referenced_hosts()? {
                            if !topology.contains_host(referenced) {
                                return Err(ScenarioError::invalid(format!(
                                    "event {} command references unknown host '{}'",
                                    index, referenced
                                )));
                            }
                        }
                    }
                }
                Action::ApplyLinkRate {
                    interface, bucket, ..
                }
                | Action::ChangeLinkRate {
                    interface, bucket, ..
                } => {
                    bucket.validate()?;
                    if !topology.interfaces_of(host).contains(interface) {
                        return Err(ScenarioError::invalid(format!(
                            "event {}: interface '{}' does not belong to host '{}'",
                            index, interface, host
                        )));
                    }
                    if !slots.insert((event.after, interface.as_str())) {
                        return Err(ScenarioError::invalid(format!(
                            "event {}: two link-rate events target '{}' at {:?}",
                            index, interface, event.after
                        )));
                    }
                }
            }

            if let Action::ChangeLinkRate { interface, .. } = &event.action {
                let installed_before = self.events.iter().any(|other| {
                    matches!(&other.action, Action::ApplyLinkRate { interface: i, .. } if i == interface)
                        && other.after < event.after
                });
                if !installed_before {
                    return Err(ScenarioError::invalid(format!(
                        "event {}: ChangeLinkRate on '{}' has no earlier ApplyLinkRate",
                        index, interface
                    )));
                }
            }
        }

        topology.with_roles(self.role_assignments())
    }
}
