//! Reconnect policy for device transports.
//!
//! # Design Decisions
//! - Only transport loss is retried, and only by reconnecting; a command that reached
//!   the device is never blindly resent by this layer
//! - Protocol errors are final
//! - Attempts are bounded unless explicitly configured as unbounded (0)

use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::resilience::backoff::calculate_backoff;

/// Backoff schedule and attempt bound for reconnecting one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base_delay_ms: config.reconnect_base_delay_ms,
            max_delay_ms: config.reconnect_max_delay_ms,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Whether `attempts` failed attempts use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}
