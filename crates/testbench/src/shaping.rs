//! Traffic control command rendering
//!
//! Static link shaping uses a TBF root qdisc for the rate with a netem child
//! for the propagation delay, the same layout on both ends of a link. Runtime
//! link-rate events install or change a plain TBF root on a host interface.

use abr_scenarios::{LinkShaping, TokenBucket};

/// Whether a qdisc is being installed or mutated in place
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QdiscVerb {
    Add,
    Change,
}

impl QdiscVerb {
    fn as_str(self) -> &'static str {
        match self {
            QdiscVerb::Add => "add",
            QdiscVerb::Change => "change",
        }
    }
}

/// `tc` arguments for a runtime token bucket on `interface`
pub fn token_bucket_args(verb: QdiscVerb, interface: &str, bucket: &TokenBucket) -> Vec<String> {
    vec![
        "qdisc".into(),
        verb.as_str().into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "tbf".into(),
        "rate".into(),
        format!("{}kbit", bucket.rate_kbit),
        "burst".into(),
        format!("{}kbit", bucket.burst_kbit),
        "latency".into(),
        format!("{}ms", bucket.latency_ms),
    ]
}

/// Shell command run on the target host for a link-rate event
pub fn token_bucket_command(verb: QdiscVerb, interface: &str, bucket: &TokenBucket) -> String {
    format!("tc {}", token_bucket_args(verb, interface, bucket).join(" "))
}

/// `tc` argument lists that shape one end of a static link
pub fn link_shaping_args(interface: &str, shaping: &LinkShaping) -> Vec<Vec<String>> {
    let rate = shaping.rate_kbit();
    // TBF needs at least one timer tick worth of tokens
    let burst = (rate / 100).max(32);

    let tbf = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "handle".into(),
        "1:".into(),
        "tbf".into(),
        "rate".into(),
        format!("{}kbit", rate),
        "burst".into(),
        format!("{}kbit", burst),
        "latency".into(),
        "50ms".into(),
    ];
    let delay_us = shaping.delay().as_micros();
    let netem = vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        interface.into(),
        "parent".into(),
        "1:1".into(),
        "handle".into(),
        "10:".into(),
        "netem".into(),
        "delay".into(),
        format!("{}us", delay_us),
    ];
    vec![tbf, netem]
}
