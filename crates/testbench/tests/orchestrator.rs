//! Orchestration tests against the simulated substrate
//!
//! Time is paused, so offsets written in milliseconds (or the presets'
//! seconds) run instantly while keeping their relative order.

use abr_scenarios::{Presets, Role, ScenarioBuilder, ScenarioDescriptor, TimedEvent, TokenBucket, TopologySpec};
use abr_testbench::{
    HarnessConfig, Orchestrator, RunOutcome, SimBehavior, SimCall, SimSubstrate, TestbenchError,
};
use std::path::Path;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("abr_testbench=debug")
        .with_test_writer()
        .try_init();
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn harness(behavior: SimBehavior, work_dir: &Path) -> (Orchestrator<SimSubstrate>, SimSubstrate) {
    let sim = SimSubstrate::new(behavior);
    let orchestrator = Orchestrator::new(sim.clone(), HarnessConfig::new(work_dir));
    (orchestrator, sim)
}

/// Chain topology, one server, one client, proxy on h2
fn basic(timeout: Duration) -> ScenarioBuilder {
    ScenarioBuilder::new("basic")
        .topology(TopologySpec::chain(10.0, 10.0))
        .alpha(0.01)
        .log_path("basic.log")
        .timeout(timeout)
        .server(Duration::ZERO, "h1", "serve 1", Some("killall httpd"))
        .proxy("h2", "./proxy")
        .client(Duration::ZERO, "h3", "fetch {addr:h2}:{port}")
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

fn spawned_command(sim: &SimSubstrate, pattern: &str) -> String {
    sim.calls()
        .into_iter()
        .find_map(|c| match c {
            SimCall::Spawn { command, .. } if command.contains(pattern) => Some(command),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no spawn matching '{}'", pattern))
}

#[tokio::test(start_paused = true)]
async fn test_preset_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior::default().exit_after("miProxy", Duration::from_secs(30), 0),
        dir.path(),
    );

    let descriptor = Presets::by_index(1).unwrap();
    let report = orchestrator.run(&descriptor).await.unwrap();
    report.log_summary();

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.result.as_ref().ok(), Some(&RunOutcome::Exited { code: Some(0) }));
    assert!(dir_is_empty(dir.path()), "registry file left behind");
    assert!(!sim.is_network_running());
    assert!(sim.running_processes().is_empty());
    assert_eq!(sim.teardowns(), 1);
    assert_eq!(sim.resets(), 2);

    // Contract arguments follow the proxy command in order
    let proxy = spawned_command(&sim, "miProxy");
    let args: Vec<&str> = proxy.split_whitespace().collect();
    assert_eq!(&args[..2], ["./miProxy", "--nodns"]);
    assert_eq!(args[2], "8888");
    assert!(args[3].ends_with(".txt") && Path::new(args[3]).is_absolute());
    assert_eq!(args[4], "0.01");
    assert_eq!(Path::new(args[5]), dir.path().join("log1.log"));

    // Client command was rendered with the proxy's address
    assert_eq!(
        spawned_command(&sim, "firefox"),
        "python firefox_open_url.py 1 10.0.0.2:8888"
    );
    // Server stop command ran during drain
    assert!(sim.calls().contains(&SimCall::Run {
        host: "h1".to_string(),
        command: "killall httpd".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_registry_contents_visible_to_proxy() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(SimBehavior::default(), dir.path());

    let descriptor = basic(ms(50)).registry_server("h4").build().unwrap();
    let run = tokio::spawn(async move { orchestrator.run(&descriptor).await });

    tokio::time::sleep(ms(10)).await;
    let proxy = spawned_command(&sim, "./proxy");
    let path = proxy.split_whitespace().nth(2).unwrap().to_string();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "10.0.0.1\n10.0.0.4\n"
    );

    let report = run.await.unwrap().unwrap();
    assert!(report.timed_out());
    assert!(!Path::new(&path).exists());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_terminates_proxy() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(SimBehavior::default(), dir.path());

    let report = orchestrator.run(&basic(ms(5)).build().unwrap()).await.unwrap();

    assert!(report.is_success());
    assert!(report.timed_out());
    assert_eq!(report.result.unwrap(), RunOutcome::TimedOut { after: ms(5) });
    assert!(report.elapsed >= ms(5));
    assert!(report.elapsed < ms(5) + ms(50));
    assert!(sim.was_terminated("./proxy"));
    assert!(sim.running_processes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_build_failure_only_resets() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior {
            fail_instantiate: true,
            ..SimBehavior::default()
        },
        dir.path(),
    );

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(matches!(report.result, Err(TestbenchError::NetworkBuild(_))));
    assert!(report.teardown_errors.is_empty());
    assert_eq!(
        sim.calls(),
        vec![
            SimCall::Reset,
            SimCall::Instantiate {
                topology: "chain".to_string()
            },
            SimCall::Reset,
        ]
    );
    assert!(dir_is_empty(dir.path()));
}

#[tokio::test(start_paused = true)]
async fn test_prepare_failure_tears_down_network() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sim = SimSubstrate::default();
    let config = HarnessConfig {
        registry_dir: Some(dir.path().join("missing")),
        ..HarnessConfig::new(dir.path())
    };
    let orchestrator = Orchestrator::new(sim.clone(), config);

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(matches!(report.result, Err(TestbenchError::RegistryIo(_))));
    assert_eq!(sim.teardowns(), 1);
    assert_eq!(sim.calls().last(), Some(&SimCall::Reset));
    assert_eq!(sim.count(|c| matches!(c, SimCall::Spawn { .. })), 0);
    assert!(!sim.is_network_running());
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_stops_started_roles() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior {
            fail_spawn_on: vec!["h2".to_string()],
            ..SimBehavior::default()
        },
        dir.path(),
    );

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    match &report.result {
        Err(TestbenchError::Launch { host, .. }) => assert_eq!(host, "h2"),
        other => panic!("expected launch failure, got {:?}", other),
    }
    // The server started before the proxy and must be stopped
    assert!(sim.was_terminated("serve 1"));
    // The client comes after the proxy in descriptor order
    assert_eq!(sim.issued_at("fetch").len(), 0);
    assert_eq!(sim.teardowns(), 1);
    assert!(dir_is_empty(dir.path()));
    assert!(sim.running_processes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deferred_events_keep_offset_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior::default().exit_after("./proxy", ms(60), 0),
        dir.path(),
    );

    let descriptor = basic(ms(100))
        .client(ms(10), "h5", "late-a")
        .client(ms(10), "h6", "late-b")
        .event(TimedEvent::apply_link_rate(ms(40), "h1", TokenBucket::mbit(1)))
        .build()
        .unwrap();
    let report = orchestrator.run(&descriptor).await.unwrap();

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.schedule.fired, 3);

    let start = sim.issued_at("serve 1")[0];
    let a = sim.issued_at("late-a")[0];
    let b = sim.issued_at("late-b")[0];
    let rate = sim.issued_at("tc qdisc add dev h1-eth0")[0];
    assert!(a - start >= ms(10));
    assert!(b - start >= ms(10));
    assert!(rate - start >= ms(40));
    assert!(rate >= a && rate >= b);
}

#[tokio::test(start_paused = true)]
async fn test_events_past_timeout_are_dropped() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(SimBehavior::default(), dir.path());

    let descriptor = basic(ms(50))
        .event(TimedEvent::apply_link_rate(ms(50), "h1", TokenBucket::mbit(1)))
        .client(ms(80), "h5", "never")
        .build()
        .unwrap();
    let report = orchestrator.run(&descriptor).await.unwrap();

    assert!(report.timed_out());
    assert_eq!(report.schedule.dropped, 2);
    assert_eq!(report.schedule.fired, 0);
    assert!(sim.issued_at("never").is_empty());
    assert!(sim.issued_at("tc").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offset_zero_link_event_runs_in_launch() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior::default().exit_after("miProxy", Duration::from_secs(1), 0),
        dir.path(),
    );

    let report = orchestrator.run(&Presets::by_index(7).unwrap()).await.unwrap();

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.schedule.fired, 0);
    assert!(sim.calls().contains(&SimCall::Run {
        host: "h1".to_string(),
        command: "tc qdisc add dev h1-eth0 root tbf rate 1000kbit burst 100kbit latency 400ms"
            .to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_deferred_event_does_not_abort_run() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _sim) = harness(
        SimBehavior {
            fail_commands_matching: vec!["tc qdisc".to_string()],
            ..SimBehavior::default()
        }
        .exit_after("./proxy", ms(30), 0),
        dir.path(),
    );

    let descriptor = basic(ms(50))
        .event(TimedEvent::apply_link_rate(ms(10), "h1", TokenBucket::kbit(50)))
        .build()
        .unwrap();
    let report = orchestrator.run(&descriptor).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.schedule.fired, 1);
    assert_eq!(report.schedule.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_errors_are_aggregated() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior {
            fail_teardown: true,
            ..SimBehavior::default()
        }
        .exit_after("./proxy", ms(5), 0),
        dir.path(),
    );

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(report.is_success());
    assert!(!report.is_clean());
    let stages: Vec<&str> = report.teardown_errors.iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec!["network"]);
    // Reset still ran after the failed teardown
    assert_eq!(sim.calls().last(), Some(&SimCall::Reset));
    assert!(dir_is_empty(dir.path()));
}

#[tokio::test(start_paused = true)]
async fn test_reset_failure_is_reported_twice() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior {
            fail_reset: true,
            ..SimBehavior::default()
        },
        dir.path(),
    );

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(matches!(report.result, Err(TestbenchError::NetworkBuild(_))));
    assert_eq!(report.teardown_errors.len(), 1);
    assert_eq!(report.teardown_errors[0].stage, "reset");
    assert_eq!(sim.count(|c| matches!(c, SimCall::Instantiate { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panic_in_forward_path_still_tears_down() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(
        SimBehavior {
            panic_on_spawn_matching: Some("./proxy".to_string()),
            ..SimBehavior::default()
        },
        dir.path(),
    );

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(matches!(report.result, Err(TestbenchError::Panicked(_))));
    assert_eq!(sim.teardowns(), 1);
    assert!(sim.was_terminated("serve 1"));
    assert!(dir_is_empty(dir.path()));
}

#[tokio::test]
async fn test_invalid_descriptor_has_no_side_effects() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sim) = harness(SimBehavior::default(), dir.path());

    let mut descriptor: ScenarioDescriptor = basic(ms(50)).build().unwrap();
    descriptor.topology = TopologySpec::chain(0.0, 10.0);
    assert!(matches!(
        orchestrator.run(&descriptor).await,
        Err(TestbenchError::InvalidParameter(_))
    ));

    let mut descriptor = basic(ms(50)).build().unwrap();
    descriptor.events.push(TimedEvent::start_role(
        ms(1),
        "h4",
        Role::ProxyUnderTest,
        "./second-proxy",
    ));
    assert!(orchestrator.run(&descriptor).await.is_err());

    assert!(sim.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_proxy_program_override() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sim = SimSubstrate::new(SimBehavior::default().exit_after("custom", ms(5), 0));
    let config = HarnessConfig {
        proxy_program: Some("/opt/bin/custom-proxy".to_string()),
        ..HarnessConfig::new(dir.path())
    };
    let orchestrator = Orchestrator::new(sim.clone(), config);

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();

    assert!(report.is_clean(), "{:?}", report);
    let proxy = spawned_command(&sim, "custom-proxy");
    assert!(proxy.starts_with("/opt/bin/custom-proxy 8888 "));
}

#[tokio::test(start_paused = true)]
async fn test_relative_work_dir_yields_absolute_log_path() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let sim = SimSubstrate::new(SimBehavior::default().exit_after("./proxy", ms(5), 0));
    let config = HarnessConfig {
        registry_dir: Some(dir.path().to_path_buf()),
        ..HarnessConfig::new("rel-work")
    };
    let orchestrator = Orchestrator::new(sim.clone(), config);

    let report = orchestrator.run(&basic(ms(50)).build().unwrap()).await.unwrap();
    assert!(report.is_clean(), "{:?}", report);

    let proxy = spawned_command(&sim, "./proxy");
    let log = Path::new(proxy.split_whitespace().nth(4).unwrap());
    assert!(log.is_absolute(), "log path {} is relative", log.display());
    assert_eq!(
        log,
        std::env::current_dir().unwrap().join("rel-work").join("basic.log")
    );
}
