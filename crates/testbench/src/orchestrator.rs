//! Scenario orchestrator
//!
//! Runs one `ScenarioDescriptor` against a substrate:
//!
//! 1. Reset the substrate
//! 2. Build the topology
//! 3. Prepare the endpoint registry
//! 4. Launch offset-zero events in descriptor order; the scenario clock starts here
//! 5. Schedule the remaining events on a dispatcher task
//! 6. Run until the proxy under test exits or the timeout elapses
//! 7. Drain residual role processes
//! 8. Teardown: close the registry, destroy the network, reset again
//!
//! A failure in steps 1-6 (including a panic) skips the remaining forward
//! steps. Drain and Teardown always run, and Teardown keeps going past
//! individual failures, collecting them in the report.

use crate::config::HarnessConfig;
use crate::registry::EndpointRegistry;
use crate::schedule::{FireFn, ScheduleSummary, Scheduler};
use crate::shaping::{token_bucket_command, QdiscVerb};
use crate::substrate::{address_map, HostHandle, ProcessHandle, RunningNetwork, Substrate};
use crate::{SubstrateError, TeardownError, TestbenchError};
use abr_scenarios::template::shell_quote;
use abr_scenarios::{
    Action, CommandTemplate, RenderContext, Role, ScenarioDescriptor, TimedEvent, TokenBucket,
    Topology,
};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// How the proxy under test finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Exited { code: Option<i32> },
    /// Still running at the scenario timeout and terminated
    TimedOut { after: Duration },
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: String,
    /// Outcome of the run, or the first forward-path error
    pub result: Result<RunOutcome, TestbenchError>,
    pub teardown_errors: Vec<TeardownError>,
    pub schedule: ScheduleSummary,
    pub elapsed: Duration,
}

impl ScenarioReport {
    /// The proxy exited or timed out without a forward-path error
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.result, Ok(RunOutcome::TimedOut { .. }))
    }

    /// Successful and nothing failed during teardown
    pub fn is_clean(&self) -> bool {
        self.is_success() && self.teardown_errors.is_empty()
    }

    pub fn log_summary(&self) {
        match &self.result {
            Ok(RunOutcome::Exited { code }) => info!(
                "Scenario '{}' passed: proxy exited with {:?} after {:.1?}",
                self.scenario, code, self.elapsed
            ),
            Ok(RunOutcome::TimedOut { after }) => info!(
                "Scenario '{}' passed: proxy ran until the {:?} timeout",
                self.scenario, after
            ),
            Err(e) => error!("Scenario '{}' failed: {}", self.scenario, e),
        }
        info!(
            "Deferred events: {} fired, {} failed, {} dropped",
            self.schedule.fired, self.schedule.failed, self.schedule.dropped
        );
        for e in &self.teardown_errors {
            warn!("Teardown error: {}", e);
        }
    }
}

/// A background role process and how to stop it
struct RoleProcess {
    host: Arc<dyn HostHandle>,
    role: Role,
    stop: Option<String>,
    process: Box<dyn ProcessHandle>,
}

/// Performs timed events on hosts; shared by Launch and the scheduler
struct EventRunner {
    hosts: HashMap<String, Arc<dyn HostHandle>>,
    context: RenderContext,
    proxy_program: Option<String>,
    proxy_args: String,
    roles: Mutex<Vec<RoleProcess>>,
    proxy: Mutex<Option<RoleProcess>>,
}

fn launch_error(host: &str, err: impl std::fmt::Display) -> TestbenchError {
    TestbenchError::Launch {
        host: host.to_string(),
        message: err.to_string(),
    }
}

impl EventRunner {
    fn host(&self, id: &str) -> Result<Arc<dyn HostHandle>, TestbenchError> {
        self.hosts
            .get(id)
            .cloned()
            .ok_or_else(|| launch_error(id, "host is not part of the running network"))
    }

    fn render(&self, host: &str, template: &CommandTemplate) -> Result<String, TestbenchError> {
        template
            .render(&self.context)
            .map_err(|e| launch_error(host, e))
    }

    async fn fire(&self, event: &TimedEvent) -> Result<(), TestbenchError> {
        let host = self.host(event.action.host())?;
        match &event.action {
            Action::StartRole {
                role,
                command,
                stop,
                ..
            } => {
                let is_proxy = *role == Role::ProxyUnderTest;
                let mut line = match &self.proxy_program {
                    Some(program) if is_proxy => program.clone(),
                    _ => self.render(host.id(), command)?,
                };
                if is_proxy {
                    line.push_str(&self.proxy_args);
                }
                let stop = stop
                    .as_ref()
                    .map(|s| self.render(host.id(), s))
                    .transpose()?;

                debug!("Starting {:?} on {}: {}", role, host.id(), line);
                let process = host
                    .spawn(&line)
                    .await
                    .map_err(|e| launch_error(host.id(), e))?;
                let started = RoleProcess {
                    host,
                    role: *role,
                    stop,
                    process,
                };
                if is_proxy {
                    *self.proxy.lock().await = Some(started);
                } else {
                    self.roles.lock().await.push(started);
                }
            }
            Action::ApplyLinkRate {
                interface, bucket, ..
            } => self.shape(&host, QdiscVerb::Add, interface, bucket).await?,
            Action::ChangeLinkRate {
                interface, bucket, ..
            } => {
                self.shape(&host, QdiscVerb::Change, interface, bucket)
                    .await?
            }
        }
        Ok(())
    }

    async fn shape(
        &self,
        host: &Arc<dyn HostHandle>,
        verb: QdiscVerb,
        interface: &str,
        bucket: &TokenBucket,
    ) -> Result<(), TestbenchError> {
        let command = token_bucket_command(verb, interface, bucket);
        debug!("{}: {}", host.id(), command);
        let output = host
            .run(&command)
            .await
            .map_err(|e| launch_error(host.id(), e))?;
        if !output.success() {
            return Err(launch_error(
                host.id(),
                format!(
                    "'{}' exited with {:?}: {}",
                    command,
                    output.code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

fn fire_fn(runner: Arc<EventRunner>) -> FireFn {
    Arc::new(move |event: TimedEvent| {
        let runner = runner.clone();
        async move { runner.fire(&event).await.map_err(|e| e.to_string()) }.boxed()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resources acquired so far by one run
struct RunState<N> {
    network: Option<N>,
    registry: Option<EndpointRegistry>,
    runner: Option<Arc<EventRunner>>,
    scheduler: Option<Scheduler>,
    schedule: ScheduleSummary,
}

impl<N> RunState<N> {
    fn new() -> Self {
        Self {
            network: None,
            registry: None,
            runner: None,
            scheduler: None,
            schedule: ScheduleSummary::default(),
        }
    }
}

pub struct Orchestrator<S: Substrate> {
    substrate: S,
    config: HarnessConfig,
    // The substrate's global state belongs to one run at a time
    exclusive: Mutex<()>,
}

impl<S: Substrate> Orchestrator<S> {
    pub fn new(substrate: S, config: HarnessConfig) -> Self {
        Self {
            substrate,
            config,
            exclusive: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Execute one scenario end to end.
    ///
    /// Returns `Err` only when the descriptor or configuration is rejected,
    /// before anything touched the substrate. Every other outcome, including
    /// forward-path failures, is a `ScenarioReport`.
    pub async fn run(&self, descriptor: &ScenarioDescriptor) -> Result<ScenarioReport, TestbenchError> {
        let config = self.config.clone().finalize()?;
        let topology = descriptor.build_topology()?;

        let _guard = self.exclusive.lock().await;
        info!(
            "Running scenario '{}' on {} topology (timeout {:?})",
            descriptor.name,
            topology.name(),
            descriptor.timeout
        );
        let started = Instant::now();
        let mut state = RunState::new();

        let forward = AssertUnwindSafe(self.forward(descriptor, &topology, &config, &mut state))
            .catch_unwind()
            .await;
        let result = match forward {
            Ok(result) => result,
            Err(payload) => Err(TestbenchError::Panicked(panic_message(payload.as_ref()))),
        };
        if let Err(e) = &result {
            error!("Scenario '{}' aborted: {}", descriptor.name, e);
        }

        self.drain(&mut state).await;
        let teardown_errors = self.teardown(&mut state).await;

        Ok(ScenarioReport {
            scenario: descriptor.name.clone(),
            result,
            teardown_errors,
            schedule: state.schedule,
            elapsed: started.elapsed(),
        })
    }

    async fn forward(
        &self,
        descriptor: &ScenarioDescriptor,
        topology: &Topology,
        config: &HarnessConfig,
        state: &mut RunState<S::Network>,
    ) -> Result<RunOutcome, TestbenchError> {
        info!("Reset: purging substrate state");
        self.substrate
            .reset()
            .await
            .map_err(TestbenchError::NetworkBuild)?;

        info!("Build: instantiating {} topology", topology.name());
        let network = self
            .substrate
            .instantiate(topology)
            .await
            .map_err(TestbenchError::NetworkBuild)?;
        let network = state.network.insert(network);
        let hosts = topology
            .hosts()
            .iter()
            .map(|h| network.host(&h.id).map(|handle| (h.id.clone(), handle)))
            .collect::<Result<HashMap<_, _>, SubstrateError>>()
            .map_err(TestbenchError::NetworkBuild)?;

        info!(
            "Prepare: publishing {} server address(es)",
            descriptor.servers.len()
        );
        let servers = descriptor
            .servers
            .iter()
            .map(|id| {
                hosts
                    .get(id)
                    .map(|h| h.address())
                    .ok_or_else(|| TestbenchError::NetworkBuild(SubstrateError::UnknownHost(id.clone())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let registry = EndpointRegistry::create(config.registry_dir(), &servers)
            .map_err(TestbenchError::RegistryIo)?;
        let registry = state.registry.insert(registry);

        let log_path = config.resolve(&descriptor.proxy.log_path);
        let proxy_args = format!(
            " {} {} {} {}",
            descriptor.proxy.listen_port,
            shell_quote(&registry.path().to_string_lossy()),
            descriptor.proxy.alpha,
            shell_quote(&log_path.to_string_lossy())
        );
        let context = RenderContext {
            addresses: address_map(hosts.values()),
            proxy_port: descriptor.proxy.listen_port,
        };
        let runner = Arc::new(EventRunner {
            hosts,
            context,
            proxy_program: config.proxy_program.clone(),
            proxy_args,
            roles: Mutex::new(Vec::new()),
            proxy: Mutex::new(None),
        });
        state.runner = Some(runner.clone());

        let (launch, deferred): (Vec<TimedEvent>, Vec<TimedEvent>) = descriptor
            .events
            .iter()
            .cloned()
            .partition(|e| e.after.is_zero());
        info!("Launch: {} event(s) at offset 0", launch.len());
        let clock = Instant::now();
        for event in &launch {
            runner.fire(event).await?;
        }

        state.scheduler = Some(Scheduler::start(
            clock,
            descriptor.timeout,
            deferred,
            fire_fn(runner.clone()),
        ));

        info!(
            "Run: waiting up to {:?} for the proxy under test",
            descriptor.timeout
        );
        let mut proxy = runner.proxy.lock().await.take().ok_or_else(|| {
            launch_error(
                descriptor.proxy_host().unwrap_or_default(),
                "proxy under test was not started",
            )
        })?;
        let outcome = match timeout_at(clock + descriptor.timeout, proxy.process.wait()).await {
            Ok(Ok(exit)) => {
                info!(
                    "Proxy under test exited with {:?} after {:?}",
                    exit.code,
                    clock.elapsed()
                );
                RunOutcome::Exited { code: exit.code }
            }
            Ok(Err(e)) => {
                runner.roles.lock().await.push(proxy);
                return Err(TestbenchError::Run(e));
            }
            Err(_) => {
                warn!(
                    "Proxy under test still running at the {:?} timeout, terminating",
                    descriptor.timeout
                );
                if let Err(e) = proxy.process.terminate(self.config.terminate_grace()).await {
                    runner.roles.lock().await.push(proxy);
                    return Err(TestbenchError::Run(e));
                }
                RunOutcome::TimedOut {
                    after: descriptor.timeout,
                }
            }
        };

        if let Some(scheduler) = state.scheduler.take() {
            state.schedule = scheduler.stop(self.config.terminate_grace()).await;
        }
        Ok(outcome)
    }

    /// Stop the scheduler and every residual role process, best effort
    async fn drain(&self, state: &mut RunState<S::Network>) {
        if let Some(scheduler) = state.scheduler.take() {
            state.schedule = scheduler.stop(self.config.terminate_grace()).await;
        }
        let Some(runner) = &state.runner else {
            return;
        };

        let mut processes: Vec<RoleProcess> = runner.roles.lock().await.drain(..).collect();
        if let Some(proxy) = runner.proxy.lock().await.take() {
            processes.push(proxy);
        }
        if processes.is_empty() {
            return;
        }
        info!("Drain: stopping {} role process(es)", processes.len());

        for p in processes.iter_mut() {
            let Some(stop) = &p.stop else {
                continue;
            };
            debug!("{}: {}", p.host.id(), stop);
            match p.host.run(stop).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(
                    "Stop command '{}' on {} exited with {:?}",
                    stop,
                    p.host.id(),
                    output.code
                ),
                Err(e) => warn!("Stop command '{}' on {} failed: {}", stop, p.host.id(), e),
            }
        }

        let grace = self.config.terminate_grace();
        let results = join_all(processes.iter_mut().map(|p| async move {
            debug!("Terminating {:?} process {}", p.role, p.process.describe());
            (p.process.describe(), p.process.terminate(grace).await)
        }))
        .await;
        for (what, result) in results {
            if let Err(e) = result {
                warn!("Failed to stop {}: {}", what, e);
            }
        }
    }

    /// Release everything, collecting failures instead of stopping at them
    async fn teardown(&self, state: &mut RunState<S::Network>) -> Vec<TeardownError> {
        info!("Teardown: releasing scenario resources");
        let mut errors = Vec::new();
        state.runner = None;

        if let Some(mut registry) = state.registry.take() {
            if let Err(e) = registry.try_close() {
                warn!("Failed to remove endpoint registry: {}", e);
                errors.push(TeardownError::new("registry", e));
            }
        }

        if let Some(mut network) = state.network.take() {
            if let Err(e) = network.teardown().await {
                warn!("Network teardown failed: {}", e);
                errors.push(TeardownError::new("network", e));
            }
        }

        if let Err(e) = self.substrate.reset().await {
            warn!("Final reset failed: {}", e);
            errors.push(TeardownError::new("reset", e));
        }

        errors
    }
}
