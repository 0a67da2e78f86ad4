//! Connection health check configuration.
//!
//! Every established connection is probed periodically; the interval gets
//! a uniformly-random jitter so a node's connections are not all checked
//! in the same instant. The timing invariant `interval > jitter + timeout`
//! guarantees a probe cycle finishes before the next one is due, so checks
//! on one connection never overlap.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health check tuning (`healthCheck.*` configuration segment).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Base period between probes on one connection.
    #[serde(default = "default_interval")]
    pub interval_msec: u64,

    /// Upper bound of the uniformly-random jitter added per cycle.
    #[serde(default = "default_max_jitter")]
    pub max_jitter_msec: u64,

    /// Per-probe response timeout.
    #[serde(default = "default_timeout")]
    pub timeout_msec: u64,

    /// Consecutive failures after which the connection is considered
    /// broken.
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
}

fn default_interval() -> u64 {
    20_000
}

fn default_max_jitter() -> u64 {
    7_000
}

fn default_timeout() -> u64 {
    10_000
}

fn default_failure_limit() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_msec: default_interval(),
            max_jitter_msec: default_max_jitter(),
            timeout_msec: default_timeout(),
            failure_limit: default_failure_limit(),
        }
    }
}

impl HealthConfig {
    /// Check the ordering invariant `interval > jitter + timeout`.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_msec <= self.max_jitter_msec + self.timeout_msec {
            return Err(format!(
                "intervalMsec ({}) must exceed maxJitterMsec ({}) + timeoutMsec ({})",
                self.interval_msec, self.max_jitter_msec, self.timeout_msec
            ));
        }
        if self.failure_limit == 0 {
            return Err("failureLimit must be at least 1".to_string());
        }
        Ok(())
    }

    /// The delay before the next probe cycle: interval plus fresh jitter.
    pub fn jittered_interval(&self) -> Duration {
        let jitter = if self.max_jitter_msec == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.max_jitter_msec)
        };
        Duration::from_millis(self.interval_msec + jitter)
    }

    /// Per-probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_msec)
    }
}
