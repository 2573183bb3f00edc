//! Linux network namespace substrate
//!
//! Every host gets its own namespace (`<prefix><host>`). Switches are Linux
//! bridges inside a shared fabric namespace (`<prefix>fabric`), and each link
//! is a veth pair whose ends land in the namespaces of its endpoints. Shaped
//! links get a TBF root with a netem child on both ends. Host commands run
//! through `ip netns exec <ns> sh -c` in their own process group, so stopping
//! a role signals the whole process tree it started.
//!
//! Requires CAP_NET_ADMIN and iproute2.

use crate::config::HarnessConfig;
use crate::shaping::link_shaping_args;
use crate::substrate::{
    assign_addresses, CommandOutput, HostHandle, ProcessExit, ProcessHandle, RunningNetwork,
    Substrate,
};
use crate::SubstrateError;
use abr_scenarios::{Endpoint, Link, Topology};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Linux interface names are limited to 15 bytes
const IFNAMSIZ: usize = 15;

async fn run_cmd(program: &str, args: &[&str]) -> Result<CommandOutput, SubstrateError> {
    debug!("Running: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| SubstrateError::Spawn {
            command: format!("{} {}", program, args.join(" ")),
            source,
        })?;
    Ok(output.into())
}

async fn run_cmd_check(program: &str, args: &[&str]) -> Result<CommandOutput, SubstrateError> {
    let output = run_cmd(program, args).await?;
    if !output.success() {
        return Err(SubstrateError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

async fn ip(args: &[&str]) -> Result<CommandOutput, SubstrateError> {
    run_cmd_check("ip", args).await
}

/// Run `tc` inside a namespace
async fn tc_in(namespace: &str, args: &[String]) -> Result<(), SubstrateError> {
    let mut full = vec!["netns", "exec", namespace, "tc"];
    full.extend(args.iter().map(String::as_str));
    ip(&full).await.map(|_| ())
}

async fn list_namespaces() -> Result<Vec<String>, SubstrateError> {
    let output = ip(&["netns", "list"]).await?;
    // Lines look like "abr-h1 (id: 3)" or just "abr-h1"
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect())
}

/// Kill every process inside `name`, then delete the namespace
async fn delete_namespace(name: &str) -> Result<(), SubstrateError> {
    if let Ok(output) = run_cmd("ip", &["netns", "pids", name]).await {
        for pid in output.stdout.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill pid {} in {}: {}", pid, name, e),
            }
        }
    }
    ip(&["netns", "del", name]).await?;
    debug!("Deleted namespace {}", name);
    Ok(())
}

fn check_ifname(name: &str) -> Result<(), SubstrateError> {
    if name.is_empty() || name.len() > IFNAMSIZ {
        return Err(SubstrateError::Unsupported(format!(
            "interface name '{}' must be 1..={} bytes",
            name, IFNAMSIZ
        )));
    }
    Ok(())
}

/// One end of a veth pair
struct Port {
    namespace: String,
    interface: String,
    bridge: Option<String>,
    address: Option<Ipv4Network>,
}

pub struct NetnsSubstrate {
    prefix: String,
    work_dir: PathBuf,
}

impl NetnsSubstrate {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            prefix: config.netns_prefix.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    fn host_namespace(&self, host: &str) -> String {
        format!("{}{}", self.prefix, host)
    }

    fn fabric_namespace(&self) -> String {
        format!("{}fabric", self.prefix)
    }

    fn port(
        &self,
        end: &Endpoint,
        peer: &Endpoint,
        addresses: &HashMap<String, Ipv4Network>,
    ) -> Result<Port, SubstrateError> {
        let port = match end {
            Endpoint::Host(id) => Port {
                namespace: self.host_namespace(id),
                interface: Topology::interface_name(id),
                bridge: None,
                address: addresses.get(id).copied(),
            },
            Endpoint::Switch(id) => Port {
                namespace: self.fabric_namespace(),
                interface: format!("{}-{}", id, peer.id()),
                bridge: Some(id.clone()),
                address: None,
            },
        };
        check_ifname(&port.interface)?;
        Ok(port)
    }

    async fn build_link(
        &self,
        link: &Link,
        addresses: &HashMap<String, Ipv4Network>,
    ) -> Result<(), SubstrateError> {
        let a = self.port(&link.a, &link.b, addresses)?;
        let b = self.port(&link.b, &link.a, addresses)?;
        debug!(
            "Creating link {}/{} <-> {}/{}",
            a.namespace, a.interface, b.namespace, b.interface
        );

        ip(&[
            "-n",
            &a.namespace,
            "link",
            "add",
            &a.interface,
            "type",
            "veth",
            "peer",
            "name",
            &b.interface,
        ])
        .await?;
        if a.namespace != b.namespace {
            ip(&["-n", &a.namespace, "link", "set", &b.interface, "netns", &b.namespace]).await?;
        }

        for port in [&a, &b] {
            if let Some(bridge) = &port.bridge {
                ip(&["-n", &port.namespace, "link", "set", &port.interface, "master", bridge])
                    .await?;
            }
            if let Some(addr) = &port.address {
                let cidr = addr.to_string();
                ip(&["-n", &port.namespace, "addr", "add", &cidr, "dev", &port.interface]).await?;
            }
            ip(&["-n", &port.namespace, "link", "set", &port.interface, "up"]).await?;

            if let Some(shaping) = &link.shaping {
                for args in link_shaping_args(&port.interface, shaping) {
                    tc_in(&port.namespace, &args).await?;
                }
            }
        }
        Ok(())
    }

    async fn build(
        &self,
        topology: &Topology,
        created: &mut Vec<String>,
    ) -> Result<HashMap<String, Arc<NetnsHost>>, SubstrateError> {
        let fabric = self.fabric_namespace();
        ip(&["netns", "add", &fabric]).await?;
        created.push(fabric.clone());

        for switch in topology.switches() {
            check_ifname(&switch.id)?;
            ip(&["-n", &fabric, "link", "add", &switch.id, "type", "bridge"]).await?;
            ip(&["-n", &fabric, "link", "set", &switch.id, "up"]).await?;
        }

        let addresses = assign_addresses(topology)?;
        let mut hosts = HashMap::new();
        for (id, addr) in &addresses {
            let namespace = self.host_namespace(id);
            ip(&["netns", "add", &namespace]).await?;
            created.push(namespace.clone());
            ip(&["-n", &namespace, "link", "set", "lo", "up"]).await?;
            hosts.insert(
                id.clone(),
                Arc::new(NetnsHost {
                    id: id.clone(),
                    namespace,
                    address: addr.ip(),
                    work_dir: self.work_dir.clone(),
                }),
            );
        }

        let addresses: HashMap<String, Ipv4Network> = addresses.into_iter().collect();
        for link in topology.links() {
            self.build_link(link, &addresses).await?;
        }
        Ok(hosts)
    }
}

#[async_trait]
impl Substrate for NetnsSubstrate {
    type Network = NetnsNetwork;

    async fn reset(&self) -> Result<(), SubstrateError> {
        let stale: Vec<String> = list_namespaces()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&self.prefix))
            .collect();

        let mut failures = Vec::new();
        for name in &stale {
            if let Err(e) = delete_namespace(name).await {
                failures.push(format!("{}: {}", name, e));
            }
        }
        if !stale.is_empty() {
            info!(
                "Cleaned up {} stale namespace(s) with prefix '{}'",
                stale.len() - failures.len(),
                self.prefix
            );
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SubstrateError::Incomplete(failures))
        }
    }

    async fn instantiate(&self, topology: &Topology) -> Result<NetnsNetwork, SubstrateError> {
        info!(
            "Building '{}' with {} hosts, {} switches, {} links",
            topology.name(),
            topology.hosts().len(),
            topology.switches().len(),
            topology.links().len()
        );

        let mut created = Vec::new();
        match self.build(topology, &mut created).await {
            Ok(hosts) => Ok(NetnsNetwork {
                hosts,
                namespaces: created,
            }),
            Err(e) => {
                for name in created.iter().rev() {
                    if let Err(cleanup) = delete_namespace(name).await {
                        warn!("Failed to remove partial namespace {}: {}", name, cleanup);
                    }
                }
                Err(e)
            }
        }
    }
}

pub struct NetnsNetwork {
    hosts: HashMap<String, Arc<NetnsHost>>,
    namespaces: Vec<String>,
}

#[async_trait]
impl RunningNetwork for NetnsNetwork {
    fn host(&self, id: &str) -> Result<Arc<dyn HostHandle>, SubstrateError> {
        self.hosts
            .get(id)
            .map(|h| h.clone() as Arc<dyn HostHandle>)
            .ok_or_else(|| SubstrateError::UnknownHost(id.to_string()))
    }

    async fn teardown(&mut self) -> Result<(), SubstrateError> {
        let mut failures = Vec::new();
        // Hosts first, the fabric was created first
        for name in self.namespaces.drain(..).rev() {
            if let Err(e) = delete_namespace(&name).await {
                failures.push(format!("{}: {}", name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SubstrateError::Incomplete(failures))
        }
    }
}

struct NetnsHost {
    id: String,
    namespace: String,
    address: Ipv4Addr,
    work_dir: PathBuf,
}

impl NetnsHost {
    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &self.namespace, "sh", "-c", command])
            .current_dir(&self.work_dir)
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl HostHandle for NetnsHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, SubstrateError> {
        debug!("{}: {}", self.id, command);
        let output = self
            .command(command)
            .output()
            .await
            .map_err(|source| SubstrateError::Spawn {
                command: command.to_string(),
                source,
            })?;
        Ok(output.into())
    }

    async fn spawn(&self, command: &str) -> Result<Box<dyn ProcessHandle>, SubstrateError> {
        debug!("{}: {} &", self.id, command);
        let child = self
            .command(command)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SubstrateError::Spawn {
                command: command.to_string(),
                source,
            })?;
        Ok(Box::new(NetnsProcess {
            description: format!("{}: {}", self.id, command),
            child,
        }))
    }
}

struct NetnsProcess {
    description: String,
    child: Child,
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), SubstrateError> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ProcessHandle for NetnsProcess {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn wait(&mut self) -> Result<ProcessExit, SubstrateError> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), SubstrateError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // process_group(0) makes the child its own group leader
        let pgid = Pid::from_raw(pid as i32);

        debug!("SIGTERM to group of {}", self.description);
        signal_group(pgid, Signal::SIGTERM)?;
        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(
                    "{} ignored SIGTERM for {:?}, sending SIGKILL",
                    self.description, grace
                );
                signal_group(pgid, Signal::SIGKILL)?;
                self.child.wait().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_names() {
        let substrate = NetnsSubstrate::new(&HarnessConfig::default());
        assert_eq!(substrate.host_namespace("h1"), "abr-h1");
        assert_eq!(substrate.fabric_namespace(), "abr-fabric");
    }

    #[test]
    fn test_port_naming() {
        let substrate = NetnsSubstrate::new(&HarnessConfig::default());
        let addresses = HashMap::from([(
            "h1".to_string(),
            Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 1), 8).unwrap(),
        )]);
        let host = Endpoint::Host("h1".to_string());
        let switch = Endpoint::Switch("s1".to_string());

        let port = substrate.port(&host, &switch, &addresses).unwrap();
        assert_eq!(port.namespace, "abr-h1");
        assert_eq!(port.interface, "h1-eth0");
        assert_eq!(port.address.map(|a| a.to_string()), Some("10.0.0.1/8".to_string()));

        let port = substrate.port(&switch, &host, &addresses).unwrap();
        assert_eq!(port.namespace, "abr-fabric");
        assert_eq!(port.interface, "s1-h1");
        assert_eq!(port.bridge.as_deref(), Some("s1"));
    }

    #[test]
    fn test_long_interface_names_rejected() {
        assert!(check_ifname("s1-s2").is_ok());
        assert!(check_ifname("a-very-long-interface").is_err());
    }

    #[cfg(feature = "sudo-tests")]
    #[tokio::test]
    async fn test_build_and_teardown_chain() {
        let config = HarnessConfig {
            netns_prefix: "abrt-".to_string(),
            ..HarnessConfig::default()
        };
        let substrate = NetnsSubstrate::new(&config);
        substrate.reset().await.unwrap();

        let topo = abr_scenarios::TopologySpec::chain(10.0, 10.0).build().unwrap();
        let mut network = substrate.instantiate(&topo).await.unwrap();
        let out = network
            .host("h3")
            .unwrap()
            .run("ping -c 1 -W 2 10.0.0.1")
            .await
            .unwrap();
        assert!(out.success(), "ping failed: {}", out.stderr);

        network.teardown().await.unwrap();
        assert!(list_namespaces()
            .await
            .unwrap()
            .iter()
            .all(|n| !n.starts_with("abrt-")));
    }
}
