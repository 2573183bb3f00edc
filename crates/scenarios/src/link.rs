//! Link parameters
//!
//! `LinkShaping` describes the static bandwidth/delay of a topology edge.
//! `TokenBucket` describes a rate limit installed or changed on a host
//! interface while a scenario is running.

use crate::{Result, ScenarioError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static shaping of a link, applied symmetrically to both directions
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkShaping {
    /// Capacity in Mbit/s, must be positive
    pub bandwidth_mbps: f64,
    /// One-way propagation delay in milliseconds, must be non-negative
    pub delay_ms: f64,
}

impl LinkShaping {
    pub fn new(bandwidth_mbps: f64, delay_ms: f64) -> Self {
        Self {
            bandwidth_mbps,
            delay_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Written as negated comparisons so NaN is rejected too
        if !(self.bandwidth_mbps > 0.0) || !self.bandwidth_mbps.is_finite() {
            return Err(ScenarioError::invalid(format!(
                "bandwidth must be positive, got {} Mbit/s",
                self.bandwidth_mbps
            )));
        }
        if !(self.delay_ms >= 0.0) || !self.delay_ms.is_finite() {
            return Err(ScenarioError::invalid(format!(
                "delay must be non-negative, got {} ms",
                self.delay_ms
            )));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_ms.max(0.0) / 1000.0)
    }

    /// Bandwidth in kbit/s, rounded, never below 1
    pub fn rate_kbit(&self) -> u64 {
        ((self.bandwidth_mbps * 1000.0).round() as u64).max(1)
    }
}

/// Token bucket rate limit for a host interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub rate_kbit: u64,
    pub burst_kbit: u64,
    pub latency_ms: u64,
}

impl TokenBucket {
    /// Bucket with the burst and latency bound used by the regression presets
    pub fn kbit(rate_kbit: u64) -> Self {
        Self {
            rate_kbit,
            burst_kbit: 100,
            latency_ms: 400,
        }
    }

    pub fn mbit(rate_mbit: u64) -> Self {
        Self::kbit(rate_mbit * 1000)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_kbit == 0 {
            return Err(ScenarioError::invalid("token bucket rate must be positive"));
        }
        if self.burst_kbit == 0 {
            return Err(ScenarioError::invalid("token bucket burst must be positive"));
        }
        Ok(())
    }
}
