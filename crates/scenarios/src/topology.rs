//! Topology model
//!
//! A `TopologySpec` names one of the fixed graph skeletons together with its
//! per-link parameters. `TopologySpec::build` turns it into an immutable
//! `Topology`: hosts, switches and links, checked for the structural
//! invariants every shape must satisfy. Building is a pure function of the
//! parameters, so two builds with identical parameters compare equal.

use crate::link::LinkShaping;
use crate::{Result, ScenarioError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Behavioural function of a host during a scenario
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
    ProxyUnderTest,
    Idle,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub id: String,
}

/// One end of a link
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Endpoint {
    Host(String),
    Switch(String),
}

impl Endpoint {
    pub fn id(&self) -> &str {
        match self {
            Endpoint::Host(id) | Endpoint::Switch(id) => id,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Endpoint::Host(_))
    }
}

/// Undirected edge; `shaping: None` leaves the link unshaped
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    pub shaping: Option<LinkShaping>,
}

impl Link {
    pub fn touches(&self, id: &str) -> bool {
        self.a.id() == id || self.b.id() == id
    }
}

/// Declarative shape plus parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TopologySpec {
    /// ```text
    ///                h2
    ///                |
    /// h1 -- [s1] -- [s2] -- [s3] -- h3
    ///        /        |       \
    ///       h6        h5       h4
    /// ```
    Chain {
        s1_s2: LinkShaping,
        s2_s3: LinkShaping,
    },
    /// ```text
    ///          h1
    ///          |
    ///  h3     [s4]     h5
    ///  |       |       |
    /// [s1] -- [s2] -- [s3]
    ///  |       |       |
    ///  h4      h2      h6
    /// ```
    /// The s4 branch is the isolated low-bandwidth branch.
    StarOfStars {
        s1_s2: LinkShaping,
        s2_s3: LinkShaping,
        s2_s4: LinkShaping,
    },
    /// Eight hosts on a single switch, no shaping
    Star,
}

impl TopologySpec {
    /// Three-switch chain with the default 40 ms / 10 ms delays
    pub fn chain(s1_s2_mbps: f64, s2_s3_mbps: f64) -> Self {
        TopologySpec::Chain {
            s1_s2: LinkShaping::new(s1_s2_mbps, 40.0),
            s2_s3: LinkShaping::new(s2_s3_mbps, 10.0),
        }
    }

    /// Four-switch star of stars with the default 5 / 10 / 40 ms delays
    pub fn star_of_stars(s1_s2_mbps: f64, s2_s3_mbps: f64, s2_s4_mbps: f64) -> Self {
        TopologySpec::StarOfStars {
            s1_s2: LinkShaping::new(s1_s2_mbps, 5.0),
            s2_s3: LinkShaping::new(s2_s3_mbps, 10.0),
            s2_s4: LinkShaping::new(s2_s4_mbps, 40.0),
        }
    }

    pub fn star() -> Self {
        TopologySpec::Star
    }

    pub fn name(&self) -> &'static str {
        match self {
            TopologySpec::Chain { .. } => "chain",
            TopologySpec::StarOfStars { .. } => "star_of_stars",
            TopologySpec::Star => "star",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let shaped: Vec<(&str, &LinkShaping)> = match self {
            TopologySpec::Chain { s1_s2, s2_s3 } => vec![("s1_s2", s1_s2), ("s2_s3", s2_s3)],
            TopologySpec::StarOfStars {
                s1_s2,
                s2_s3,
                s2_s4,
            } => vec![("s1_s2", s1_s2), ("s2_s3", s2_s3), ("s2_s4", s2_s4)],
            TopologySpec::Star => Vec::new(),
        };

        for (name, shaping) in shaped {
            shaping.validate().map_err(|e| {
                ScenarioError::invalid(format!("{} link {}: {}", self.name(), name, e))
            })?;
        }
        Ok(())
    }

    /// Build the concrete graph for this shape
    pub fn build(&self) -> Result<Topology> {
        self.validate()?;

        let mut graph = GraphBuilder::new(self.name());
        match self {
            TopologySpec::Chain { s1_s2, s2_s3 } => {
                graph.hosts(6).switches(3);
                graph.access("h1", "s1");
                graph.access("h6", "s1");
                graph.access("h2", "s2");
                graph.access("h5", "s2");
                graph.access("h3", "s3");
                graph.access("h4", "s3");
                graph.trunk("s1", "s2", *s1_s2);
                graph.trunk("s2", "s3", *s2_s3);
            }
            TopologySpec::StarOfStars {
                s1_s2,
                s2_s3,
                s2_s4,
            } => {
                graph.hosts(6).switches(4);
                graph.access("h1", "s4");
                graph.access("h2", "s2");
                graph.access("h3", "s1");
                graph.access("h4", "s1");
                graph.access("h5", "s3");
                graph.access("h6", "s3");
                graph.trunk("s1", "s2", *s1_s2);
                graph.trunk("s2", "s3", *s2_s3);
                graph.trunk("s2", "s4", *s2_s4);
            }
            TopologySpec::Star => {
                graph.hosts(8).switches(1);
                for i in 1..=8 {
                    graph.access(&format!("h{}", i), "s1");
                }
            }
        }

        graph.finish()
    }
}

struct GraphBuilder {
    topology: Topology,
}

impl GraphBuilder {
    fn new(name: &str) -> Self {
        Self {
            topology: Topology {
                name: name.to_string(),
                hosts: Vec::new(),
                switches: Vec::new(),
                links: Vec::new(),
            },
        }
    }

    fn hosts(&mut self, count: usize) -> &mut Self {
        self.topology.hosts.extend((1..=count).map(|i| Host {
            id: format!("h{}", i),
            role: Role::Idle,
        }));
        self
    }

    fn switches(&mut self, count: usize) -> &mut Self {
        self.topology.switches.extend((1..=count).map(|i| Switch {
            id: format!("s{}", i),
        }));
        self
    }

    fn access(&mut self, host: &str, switch: &str) {
        self.topology.links.push(Link {
            a: Endpoint::Host(host.to_string()),
            b: Endpoint::Switch(switch.to_string()),
            shaping: None,
        });
    }

    fn trunk(&mut self, a: &str, b: &str, shaping: LinkShaping) {
        self.topology.links.push(Link {
            a: Endpoint::Switch(a.to_string()),
            b: Endpoint::Switch(b.to_string()),
            shaping: Some(shaping),
        });
    }

    fn finish(self) -> Result<Topology> {
        self.topology.check_invariants()?;
        Ok(self.topology)
    }
}

/// Immutable network graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    name: String,
    hosts: Vec<Host>,
    switches: Vec<Switch>,
    links: Vec<Link>,
}

impl Topology {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn host(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn contains_host(&self, id: &str) -> bool {
        self.host(id).is_some()
    }

    pub fn hosts_with_role(&self, role: Role) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(move |h| h.role == role)
    }

    /// Interface names of a host, one per incident link, in link order
    pub fn interfaces_of(&self, host: &str) -> Vec<String> {
        self.links
            .iter()
            .filter(|l| {
                (l.a.is_host() && l.a.id() == host) || (l.b.is_host() && l.b.id() == host)
            })
            .enumerate()
            .map(|(i, _)| format!("{}-eth{}", host, i))
            .collect()
    }

    /// Primary interface of a host
    pub fn interface_name(host: &str) -> String {
        format!("{}-eth0", host)
    }

    /// Return a fresh topology with the given role assignments
    pub fn with_roles<I, S>(mut self, roles: I) -> Result<Topology>
    where
        I: IntoIterator<Item = (S, Role)>,
        S: AsRef<str>,
    {
        for (id, role) in roles {
            let id = id.as_ref();
            let host = self
                .hosts
                .iter_mut()
                .find(|h| h.id == id)
                .ok_or_else(|| ScenarioError::invalid(format!("unknown host '{}'", id)))?;
            if host.role != Role::Idle && host.role != role {
                return Err(ScenarioError::invalid(format!(
                    "host '{}' assigned both {:?} and {:?}",
                    id, host.role, role
                )));
            }
            host.role = role;
        }
        Ok(self)
    }

    fn check_invariants(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for id in self
            .hosts
            .iter()
            .map(|h| h.id.as_str())
            .chain(self.switches.iter().map(|s| s.id.as_str()))
        {
            if !ids.insert(id) {
                return Err(ScenarioError::invalid(format!("duplicate node id '{}'", id)));
            }
        }

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for link in &self.links {
            for end in [&link.a, &link.b] {
                let known = match end {
                    Endpoint::Host(id) => self.contains_host(id),
                    Endpoint::Switch(id) => self.switches.iter().any(|s| &s.id == id),
                };
                if !known {
                    return Err(ScenarioError::invalid(format!(
                        "link references unknown node '{}'",
                        end.id()
                    )));
                }
            }
            if link.a == link.b {
                return Err(ScenarioError::invalid(format!(
                    "self-loop on '{}'",
                    link.a.id()
                )));
            }
            if let Some(shaping) = &link.shaping {
                shaping.validate()?;
            }
            adjacency.entry(link.a.id()).or_default().push(link.b.id());
            adjacency.entry(link.b.id()).or_default().push(link.a.id());
        }

        for host in &self.hosts {
            let degree = adjacency.get(host.id.as_str()).map_or(0, Vec::len);
            if degree != 1 {
                return Err(ScenarioError::invalid(format!(
                    "host '{}' has {} links, expected exactly one",
                    host.id, degree
                )));
            }
        }

        // Connectivity over hosts and switches
        let Some(start) = ids.iter().next().copied() else {
            return Ok(());
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in adjacency.get(node).into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        if seen.len() != ids.len() {
            return Err(ScenarioError::invalid(format!(
                "topology '{}' is not connected",
                self.name
            )));
        }

        Ok(())
    }
}
