//! In-memory emulation substrate
//!
//! `SimSubstrate` stands in for a real network when privileges or kernel
//! support are missing. Hosts get the same addresses a real substrate would
//! assign, commands are recorded in a journal with the instant they were
//! issued, and background processes live until a configured lifetime elapses
//! or they are terminated. Failures can be injected at every substrate call.

use crate::substrate::{
    assign_addresses, CommandOutput, HostHandle, ProcessExit, ProcessHandle, RunningNetwork,
    Substrate,
};
use crate::SubstrateError;
use abr_scenarios::Topology;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// One recorded substrate interaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimCall {
    Reset,
    Instantiate { topology: String },
    Run { host: String, command: String },
    Spawn { host: String, command: String },
    Terminate { host: String, command: String },
    Teardown,
}

#[derive(Clone, Debug)]
pub struct SimRecord {
    pub at: Instant,
    pub call: SimCall,
}

/// How long a simulated background process runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    ExitAfter { after: Duration, code: i32 },
    Never,
}

/// Failure injection and process lifetimes, matched by command substring
#[derive(Clone, Debug, Default)]
pub struct SimBehavior {
    pub fail_reset: bool,
    pub fail_instantiate: bool,
    pub fail_teardown: bool,
    /// Hosts on which every spawn fails
    pub fail_spawn_on: Vec<String>,
    /// Foreground commands containing one of these exit with status 1
    pub fail_commands_matching: Vec<String>,
    /// A spawn whose command contains this panics
    pub panic_on_spawn_matching: Option<String>,
    /// First match wins; unmatched processes never exit
    pub lifetimes: Vec<(String, Lifetime)>,
}

impl SimBehavior {
    pub fn exit_after(mut self, pattern: &str, after: Duration, code: i32) -> Self {
        self.lifetimes
            .push((pattern.to_string(), Lifetime::ExitAfter { after, code }));
        self
    }

    fn lifetime_of(&self, command: &str) -> Lifetime {
        self.lifetimes
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or(Lifetime::Never, |(_, lifetime)| *lifetime)
    }
}

struct SimProcessState {
    host: String,
    command: String,
    exit: Option<(Instant, i32)>,
    terminated: AtomicBool,
}

impl SimProcessState {
    fn is_running(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
            && self.exit.map_or(true, |(at, _)| at > Instant::now())
    }
}

struct Inner {
    behavior: SimBehavior,
    journal: Mutex<Vec<SimRecord>>,
    network_running: AtomicBool,
    processes: Mutex<Vec<Arc<SimProcessState>>>,
}

impl Inner {
    fn record(&self, call: SimCall) {
        debug!("sim: {:?}", call);
        self.journal.lock().push(SimRecord {
            at: Instant::now(),
            call,
        });
    }

    fn kill_all(&self) {
        for process in self.processes.lock().iter() {
            process.terminated.store(true, Ordering::SeqCst);
        }
    }
}

/// Cloning shares the journal, so a test can keep one handle for inspection
#[derive(Clone)]
pub struct SimSubstrate {
    inner: Arc<Inner>,
}

impl Default for SimSubstrate {
    fn default() -> Self {
        Self::new(SimBehavior::default())
    }
}

impl SimSubstrate {
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                behavior,
                journal: Mutex::new(Vec::new()),
                network_running: AtomicBool::new(false),
                processes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn journal(&self) -> Vec<SimRecord> {
        self.inner.journal.lock().clone()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.journal.lock().iter().map(|r| r.call.clone()).collect()
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.inner.journal.lock().iter().filter(|r| pred(&r.call)).count()
    }

    pub fn resets(&self) -> usize {
        self.count(|c| matches!(c, SimCall::Reset))
    }

    pub fn teardowns(&self) -> usize {
        self.count(|c| matches!(c, SimCall::Teardown))
    }

    pub fn is_network_running(&self) -> bool {
        self.inner.network_running.load(Ordering::SeqCst)
    }

    /// Commands of processes that are still alive
    pub fn running_processes(&self) -> Vec<String> {
        self.inner
            .processes
            .lock()
            .iter()
            .filter(|p| p.is_running())
            .map(|p| format!("{}: {}", p.host, p.command))
            .collect()
    }

    /// Whether a process whose command contains `pattern` was terminated
    pub fn was_terminated(&self, pattern: &str) -> bool {
        self.count(|c| matches!(c, SimCall::Terminate { command, .. } if command.contains(pattern)))
            > 0
    }

    /// Instants at which spawns or runs containing `pattern` were issued
    pub fn issued_at(&self, pattern: &str) -> Vec<Instant> {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|r| match &r.call {
                SimCall::Spawn { command, .. } | SimCall::Run { command, .. } => {
                    command.contains(pattern)
                }
                _ => false,
            })
            .map(|r| r.at)
            .collect()
    }
}

#[async_trait]
impl Substrate for SimSubstrate {
    type Network = SimNetwork;

    async fn reset(&self) -> Result<(), SubstrateError> {
        self.inner.record(SimCall::Reset);
        if self.inner.behavior.fail_reset {
            return Err(SubstrateError::Simulated("reset refused".to_string()));
        }
        self.inner.kill_all();
        self.inner.network_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn instantiate(&self, topology: &Topology) -> Result<SimNetwork, SubstrateError> {
        self.inner.record(SimCall::Instantiate {
            topology: topology.name().to_string(),
        });
        if self.inner.behavior.fail_instantiate {
            return Err(SubstrateError::Simulated(format!(
                "cannot instantiate '{}'",
                topology.name()
            )));
        }

        let hosts = assign_addresses(topology)?
            .into_iter()
            .map(|(id, net)| {
                let host = Arc::new(SimHost {
                    id: id.clone(),
                    address: net.ip(),
                    inner: self.inner.clone(),
                });
                (id, host)
            })
            .collect();
        self.inner.network_running.store(true, Ordering::SeqCst);

        Ok(SimNetwork {
            inner: self.inner.clone(),
            hosts,
        })
    }
}

pub struct SimNetwork {
    inner: Arc<Inner>,
    hosts: HashMap<String, Arc<SimHost>>,
}

#[async_trait]
impl RunningNetwork for SimNetwork {
    fn host(&self, id: &str) -> Result<Arc<dyn HostHandle>, SubstrateError> {
        self.hosts
            .get(id)
            .map(|h| h.clone() as Arc<dyn HostHandle>)
            .ok_or_else(|| SubstrateError::UnknownHost(id.to_string()))
    }

    async fn teardown(&mut self) -> Result<(), SubstrateError> {
        self.inner.record(SimCall::Teardown);
        if self.inner.behavior.fail_teardown {
            return Err(SubstrateError::Simulated("teardown refused".to_string()));
        }
        self.inner.kill_all();
        self.inner.network_running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct SimHost {
    id: String,
    address: Ipv4Addr,
    inner: Arc<Inner>,
}

#[async_trait]
impl HostHandle for SimHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, SubstrateError> {
        self.inner.record(SimCall::Run {
            host: self.id.clone(),
            command: command.to_string(),
        });
        let fails = self
            .inner
            .behavior
            .fail_commands_matching
            .iter()
            .any(|p| command.contains(p.as_str()));
        Ok(CommandOutput {
            code: Some(if fails { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if fails {
                "simulated failure".to_string()
            } else {
                String::new()
            },
        })
    }

    async fn spawn(&self, command: &str) -> Result<Box<dyn ProcessHandle>, SubstrateError> {
        self.inner.record(SimCall::Spawn {
            host: self.id.clone(),
            command: command.to_string(),
        });
        let behavior = &self.inner.behavior;
        if let Some(pattern) = &behavior.panic_on_spawn_matching {
            if command.contains(pattern.as_str()) {
                panic!("simulated panic spawning '{}'", command);
            }
        }
        if behavior.fail_spawn_on.iter().any(|h| h == &self.id) {
            return Err(SubstrateError::Simulated(format!(
                "spawn refused on {}",
                self.id
            )));
        }

        let exit = match behavior.lifetime_of(command) {
            Lifetime::ExitAfter { after, code } => Some((Instant::now() + after, code)),
            Lifetime::Never => None,
        };
        let state = Arc::new(SimProcessState {
            host: self.id.clone(),
            command: command.to_string(),
            exit,
            terminated: AtomicBool::new(false),
        });
        self.inner.processes.lock().push(state.clone());

        Ok(Box::new(SimProcess {
            inner: self.inner.clone(),
            state,
        }))
    }
}

struct SimProcess {
    inner: Arc<Inner>,
    state: Arc<SimProcessState>,
}

#[async_trait]
impl ProcessHandle for SimProcess {
    fn describe(&self) -> String {
        format!("{}: {}", self.state.host, self.state.command)
    }

    async fn wait(&mut self) -> Result<ProcessExit, SubstrateError> {
        if self.state.terminated.load(Ordering::SeqCst) {
            return Ok(ProcessExit { code: None });
        }
        match self.state.exit {
            Some((at, code)) => {
                sleep_until(at).await;
                Ok(ProcessExit { code: Some(code) })
            }
            None => futures::future::pending().await,
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<(), SubstrateError> {
        self.inner.record(SimCall::Terminate {
            host: self.state.host.clone(),
            command: self.state.command.clone(),
        });
        self.state.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abr_scenarios::TopologySpec;

    #[tokio::test(start_paused = true)]
    async fn test_process_lifetimes() {
        let sim = SimSubstrate::new(
            SimBehavior::default().exit_after("short", Duration::from_millis(5), 3),
        );
        let topo = TopologySpec::chain(10.0, 10.0).build().unwrap();
        let network = sim.instantiate(&topo).await.unwrap();
        let host = network.host("h1").unwrap();
        assert_eq!(host.address(), Ipv4Addr::new(10, 0, 0, 1));

        let mut short = host.spawn("short job").await.unwrap();
        let mut long = host.spawn("long job").await.unwrap();
        assert_eq!(short.wait().await.unwrap(), ProcessExit { code: Some(3) });

        let waited = tokio::time::timeout(Duration::from_millis(50), long.wait()).await;
        assert!(waited.is_err());
        assert_eq!(sim.running_processes(), vec!["h1: long job".to_string()]);

        long.terminate(Duration::ZERO).await.unwrap();
        assert!(sim.was_terminated("long"));
        assert!(sim.running_processes().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sim = SimSubstrate::new(SimBehavior {
            fail_spawn_on: vec!["h2".to_string()],
            fail_commands_matching: vec!["tc".to_string()],
            ..SimBehavior::default()
        });
        let topo = TopologySpec::star().build().unwrap();
        let mut network = sim.instantiate(&topo).await.unwrap();
        assert!(sim.is_network_running());

        assert!(network.host("h2").unwrap().spawn("x").await.is_err());
        assert!(network.host("h9").is_err());
        let out = network.host("h1").unwrap().run("tc qdisc").await.unwrap();
        assert!(!out.success());

        network.teardown().await.unwrap();
        assert!(!sim.is_network_running());
        assert_eq!(sim.teardowns(), 1);
    }
}
