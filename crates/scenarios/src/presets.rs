//! Regression scenarios for the adaptive-bitrate proxy
//!
//! Ten fixed scenarios covering steady high and low bandwidth, step changes
//! during playback, two-browser fairness, and multiple HTTP servers with
//! staggered clients. They are addressed by a 1-based index from the CLI.

use crate::builder::ScenarioBuilder;
use crate::link::TokenBucket;
use crate::scenario::ScenarioDescriptor;
use crate::schedule::TimedEvent;
use crate::topology::TopologySpec;
use crate::{Result, ScenarioError};
use std::time::Duration;

const PROXY_HOST: &str = "h2";
const PROXY_PROGRAM: &str = "./miProxy --nodns";
const PROXY_PORT: u16 = 8888;

pub struct Presets;

impl Presets {
    pub const COUNT: usize = 10;

    /// All scenarios in index order
    pub fn all() -> Vec<ScenarioDescriptor> {
        (1..=Self::COUNT)
            .filter_map(|i| Self::by_index(i).ok())
            .collect()
    }

    /// Scenario `index`, counted from 1
    pub fn by_index(index: usize) -> Result<ScenarioDescriptor> {
        let secs = Duration::from_secs;
        match index {
            1 => base(1, TopologySpec::chain(10.0, 10.0), 0.01, secs(50))
                .description("High bandwidth with low alpha (slow bitrate increase)")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .client(secs(0), "h3", &client_cmd(1))
                .build(),
            2 => base(2, TopologySpec::chain(10.0, 10.0), 0.5, secs(100))
                .description("High bandwidth with large alpha (fast bitrate increase)")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .client(secs(0), "h3", &client_cmd(1))
                .build(),
            3 => base(3, TopologySpec::chain(0.5, 0.5), 0.5, secs(100))
                .description("Constant 0.5 Mbit/s bottleneck")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .client(secs(0), "h3", &client_cmd(1))
                .build(),
            4 => base(4, TopologySpec::chain(10.0, 10.0), 0.5, secs(100))
                .description("Bandwidth drop from 10 Mbit/s to 1 Mbit/s at 40 s")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .event(TimedEvent::apply_link_rate(secs(40), "h1", TokenBucket::mbit(1)))
                .client(secs(0), "h3", &client_cmd(1))
                .build(),
            5 => base(5, TopologySpec::chain(2.0, 2.0), 0.9, secs(100))
                .description("Sudden drop below 100 kbit/s (50 kbit/s) at 20 s")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .event(TimedEvent::apply_link_rate(secs(20), "h1", TokenBucket::kbit(50)))
                .client(secs(0), "h3", &client_cmd(1))
                .build(),
            6 => two_browsers(6, "Two browsers sharing the proxy").build(),
            7 => two_browsers(7, "Two browsers behind a 1000 kbit/s server link")
                .event(TimedEvent::apply_link_rate(secs(0), "h1", TokenBucket::kbit(1000)))
                .build(),
            8 => two_browsers(8, "Two browsers, 1 Mbit/s at 25 s, back to 10 Mbit/s at 60 s")
                .event(TimedEvent::apply_link_rate(secs(25), "h1", TokenBucket::mbit(1)))
                .event(TimedEvent::change_link_rate(secs(60), "h1", TokenBucket::mbit(10)))
                .build(),
            9 => base(9, TopologySpec::chain(10.0, 10.0), 0.01, secs(150))
                .description("Two HTTP servers, clients joining at 0, 10 and 20 s")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .server(secs(0), "h4", &server_cmd(4), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .client(secs(0), "h3", &client_cmd(1))
                .client(secs(10), "h5", &client_cmd(5))
                .client(secs(20), "h6", &client_cmd(6))
                .build(),
            10 => base(10, TopologySpec::star(), 0.5, secs(150))
                .description("Two HTTP servers on a star, clients joining at 0, 20 and 40 s")
                .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
                .server(secs(0), "h4", &server_cmd(4), Some(SERVER_STOP))
                .proxy(PROXY_HOST, PROXY_PROGRAM)
                .client(secs(0), "h3", &client_cmd(1))
                .client(secs(20), "h5", &client_cmd(5))
                .client(secs(40), "h6", &client_cmd(6))
                .build(),
            _ => Err(ScenarioError::invalid(format!(
                "scenario index must be in 1..={}, got {}",
                Self::COUNT,
                index
            ))),
        }
    }
}

const SERVER_STOP: &str = "killall httpd";

fn server_cmd(id: u32) -> String {
    format!("python start_server.py {}", id)
}

fn client_cmd(id: u32) -> String {
    format!("python firefox_open_url.py {} {{addr:{}}}:{{port}}", id, PROXY_HOST)
}

fn base(index: usize, topology: TopologySpec, alpha: f64, timeout: Duration) -> ScenarioBuilder {
    ScenarioBuilder::new(format!("testcase{}", index))
        .topology(topology)
        .listen_port(PROXY_PORT)
        .alpha(alpha)
        .log_path(format!("log{}.log", index))
        .timeout(timeout)
}

fn two_browsers(index: usize, description: &str) -> ScenarioBuilder {
    let secs = Duration::from_secs;
    base(
        index,
        TopologySpec::star_of_stars(10.0, 10.0, 10.0),
        0.5,
        secs(100),
    )
    .description(description)
    .server(secs(0), "h1", &server_cmd(1), Some(SERVER_STOP))
    .proxy(PROXY_HOST, PROXY_PROGRAM)
    .client(secs(0), "h3", &client_cmd(1))
    .client(secs(0), "h5", &client_cmd(2))
}
