//! Emulation substrate interface
//!
//! The orchestrator never touches namespaces, bridges or processes directly.
//! It talks to a `Substrate`, which turns a `Topology` into a
//! `RunningNetwork` whose hosts can run commands in the foreground or start
//! long-running processes that are later waited on or terminated.

use crate::SubstrateError;
use abr_scenarios::Topology;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Result of a foreground command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the command was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// How a background process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
}

/// A background process started on a host
#[async_trait]
pub trait ProcessHandle: Send {
    /// Human-readable host and command, for logs
    fn describe(&self) -> String;

    /// Wait for the process to exit. Cancel-safe.
    async fn wait(&mut self) -> Result<ProcessExit, SubstrateError>;

    /// Stop the process and everything it spawned, escalating after `grace`.
    /// A process that already exited is not an error.
    async fn terminate(&mut self, grace: Duration) -> Result<(), SubstrateError>;
}

#[async_trait]
pub trait HostHandle: Send + Sync {
    fn id(&self) -> &str;

    fn address(&self) -> Ipv4Addr;

    /// Run a shell command to completion
    async fn run(&self, command: &str) -> Result<CommandOutput, SubstrateError>;

    /// Start a shell command in the background
    async fn spawn(&self, command: &str) -> Result<Box<dyn ProcessHandle>, SubstrateError>;
}

#[async_trait]
pub trait RunningNetwork: Send + Sync {
    fn host(&self, id: &str) -> Result<Arc<dyn HostHandle>, SubstrateError>;

    /// Destroy every host, link and process of this network
    async fn teardown(&mut self) -> Result<(), SubstrateError>;
}

#[async_trait]
pub trait Substrate: Send + Sync {
    type Network: RunningNetwork + 'static;

    /// Purge any state left by earlier runs. Nothing to clean is success.
    async fn reset(&self) -> Result<(), SubstrateError>;

    async fn instantiate(&self, topology: &Topology) -> Result<Self::Network, SubstrateError>;
}

/// Addresses for every host, in topology order: the i-th host gets
/// `10.0.0.(i+1)/8`
pub fn assign_addresses(topology: &Topology) -> Result<Vec<(String, Ipv4Network)>, SubstrateError> {
    let subnet = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 8)
        .map_err(|e| SubstrateError::Unsupported(e.to_string()))?;
    let base = u32::from(subnet.network());

    topology
        .hosts()
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let addr = Ipv4Addr::from(base + i as u32 + 1);
            if !subnet.contains(addr) || addr == subnet.broadcast() {
                return Err(SubstrateError::Unsupported(format!(
                    "no address left in {} for host '{}'",
                    subnet, host.id
                )));
            }
            let network = Ipv4Network::new(addr, subnet.prefix())
                .map_err(|e| SubstrateError::Unsupported(e.to_string()))?;
            Ok((host.id.clone(), network))
        })
        .collect()
}

/// Address map handed to command templates
pub fn address_map<'a, I>(hosts: I) -> HashMap<String, IpAddr>
where
    I: IntoIterator<Item = &'a Arc<dyn HostHandle>>,
{
    hosts
        .into_iter()
        .map(|h| (h.id().to_string(), IpAddr::V4(h.address())))
        .collect()
}
