//! Timed scenario events
//!
//! Every event carries an offset from the scenario clock (started when the
//! orchestrator begins launching roles) and an action to perform on one host.

use crate::link::TokenBucket;
use crate::template::CommandTemplate;
use crate::topology::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Action bound to an offset from scenario start
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub after: Duration,
    pub action: Action,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Start a long-running role process in the background
    StartRole {
        host: String,
        role: Role,
        command: CommandTemplate,
        /// Issued on the same host during drain, before the process is signalled
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<CommandTemplate>,
    },
    /// Install a token bucket on an interface that has no shaping rule yet
    ApplyLinkRate {
        host: String,
        interface: String,
        bucket: TokenBucket,
    },
    /// Mutate a token bucket previously installed by `ApplyLinkRate`
    ChangeLinkRate {
        host: String,
        interface: String,
        bucket: TokenBucket,
    },
}

impl Action {
    pub fn host(&self) -> &str {
        match self {
            Action::StartRole { host, .. }
            | Action::ApplyLinkRate { host, .. }
            | Action::ChangeLinkRate { host, .. } => host,
        }
    }

    /// Interface touched by a link-rate action
    pub fn interface(&self) -> Option<&str> {
        match self {
            Action::ApplyLinkRate { interface, .. } | Action::ChangeLinkRate { interface, .. } => {
                Some(interface)
            }
            Action::StartRole { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::StartRole { .. } => "start_role",
            Action::ApplyLinkRate { .. } => "apply_link_rate",
            Action::ChangeLinkRate { .. } => "change_link_rate",
        }
    }

    pub fn is_proxy_start(&self) -> bool {
        matches!(
            self,
            Action::StartRole {
                role: Role::ProxyUnderTest,
                ..
            }
        )
    }
}

impl TimedEvent {
    pub fn at(after: Duration, action: Action) -> Self {
        Self { after, action }
    }

    pub fn start_role(
        after: Duration,
        host: impl Into<String>,
        role: Role,
        command: impl Into<String>,
    ) -> Self {
        Self::at(
            after,
            Action::StartRole {
                host: host.into(),
                role,
                command: CommandTemplate::new(command),
                stop: None,
            },
        )
    }

    /// Install a token bucket on `<host>-eth0`
    pub fn apply_link_rate(after: Duration, host: impl Into<String>, bucket: TokenBucket) -> Self {
        let host = host.into();
        Self::at(
            after,
            Action::ApplyLinkRate {
                interface: format!("{}-eth0", host),
                host,
                bucket,
            },
        )
    }

    /// Change the token bucket on `<host>-eth0`
    pub fn change_link_rate(after: Duration, host: impl Into<String>, bucket: TokenBucket) -> Self {
        let host = host.into();
        Self::at(
            after,
            Action::ChangeLinkRate {
                interface: format!("{}-eth0", host),
                host,
                bucket,
            },
        )
    }

    /// Attach a stop command to a `StartRole` event; other actions are unchanged
    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        if let Action::StartRole { stop: slot, .. } = &mut self.action {
            *slot = Some(CommandTemplate::new(stop));
        }
        self
    }
}
