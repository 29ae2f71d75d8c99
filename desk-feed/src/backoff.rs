//! Reconnect backoff policy
//!
//! Delay grows by a factor of 1.5 per failed attempt and is capped, so a
//! flapping endpoint settles into a steady retry cadence instead of
//! hammering the backend.

use std::time::Duration;

/// Default delay before the first reconnect attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Ceiling for the backoff delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default reconnect budget before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff schedule for reconnection attempts
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Delay for the first attempt
    pub base: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Cap applied to the computed delay
    pub max_delay: Duration,
    /// Attempts allowed before the driver gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            factor: 1.5,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * factor^(attempt - 1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// True once the reconnect budget is spent
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
