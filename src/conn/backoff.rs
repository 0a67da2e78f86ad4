//! Reconnect backoff.
//!
//! Delays start at the contact point's configured initial delay (or the
//! system default), grow by the configured multiplier per attempt, and are
//! capped at the configured maximum: monotonic, then flat.

use crate::contact::ContactPoint;
use std::time::Duration;

/// System-wide retry defaults, used when a contact point carries no
/// explicit retry options.
#[derive(Clone, Copy, Debug)]
pub struct RetryDefaults {
    pub initial_delay_ms: u64,
    pub maximum_delay_ms: u64,
    pub delay_multiplier: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            maximum_delay_ms: 300_000,
            delay_multiplier: 1.5,
        }
    }
}

/// Per-connection backoff state across attempts.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    current_ms: u64,
    maximum_ms: u64,
    multiplier: f64,
}

impl RetrySchedule {
    /// Build a schedule from explicit parameters.
    ///
    /// A multiplier below 1 would make delays shrink; it is clamped to 1.
    pub fn new(initial_ms: u64, maximum_ms: u64, multiplier: f64) -> Self {
        Self {
            current_ms: initial_ms.min(maximum_ms),
            maximum_ms,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Build a schedule from a contact point's retry options, falling back
    /// to the system defaults per missing option.
    pub fn for_contact(contact: &ContactPoint, defaults: &RetryDefaults) -> Self {
        Self::new(
            contact
                .retry_initial_delay_ms()
                .unwrap_or(defaults.initial_delay_ms),
            contact
                .retry_maximum_delay_ms()
                .unwrap_or(defaults.maximum_delay_ms),
            contact
                .retry_delay_multiplier()
                .unwrap_or(defaults.delay_multiplier),
        )
    }

    /// The delay to wait before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        let grown = (self.current_ms as f64 * self.multiplier).round() as u64;
        self.current_ms = grown.min(self.maximum_ms);
        Duration::from_millis(delay)
    }
}
