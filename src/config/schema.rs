//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the device layer.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceDescriptor;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Admin status API settings.
    pub admin: AdminConfig,

    /// Connection manager settings.
    pub connections: ConnectionConfig,

    /// Default circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-dependency breaker overrides, keyed by breaker name (e.g. "device:matrix-1").
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,

    /// Rate limiting tiers.
    pub rate_limit: RateLimitConfig,

    /// Health monitor settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Initial device registry contents.
    pub devices: Vec<DeviceDescriptor>,

    /// External HTTP APIs reached through circuit breakers.
    pub upstreams: Vec<UpstreamConfig>,
}

/// What happens when a command arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Refuse the new command with `QueueFull`.
    #[default]
    RejectNew,
    /// Evict the oldest queued command (it fails with `QueueFull`) and keep the new one.
    DropOldest,
}

/// What happens to queued commands when a connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Send queued commands first if the device is connected, reject the rest.
    #[default]
    Drain,
    /// Reject every queued command immediately.
    Reject,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Default per-command timeout in milliseconds.
    pub command_timeout_ms: u64,

    /// Keep-alive probe interval in seconds.
    pub keep_alive_interval_secs: u64,

    /// Keep-alive probe timeout in milliseconds.
    pub keep_alive_timeout_ms: u64,

    /// Consecutive probe failures before reconnecting.
    pub keep_alive_failure_threshold: u32,

    /// Base delay for reconnect backoff in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay for reconnect backoff in milliseconds.
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before the device is marked failed (0 = never give up).
    pub max_reconnect_attempts: u32,

    /// Maximum queued commands per device.
    pub queue_capacity: usize,

    /// Overflow policy, fixed per deployment.
    pub queue_full_policy: QueueFullPolicy,

    /// Delay between queued commands when draining after reconnection, in milliseconds.
    pub queue_drain_delay_ms: u64,

    /// Maximum time a command may wait in the queue, in seconds.
    pub max_queue_wait_secs: u64,

    /// Maximum send attempts for a queued command.
    pub max_command_attempts: u32,

    /// Inactivity after which a connection is closed, in seconds.
    pub idle_timeout_secs: u64,

    /// Interval between idle-connection sweeps, in seconds.
    pub cleanup_interval_secs: u64,

    /// Queue handling on explicit disconnect.
    pub disconnect_policy: DrainPolicy,

    /// Queue handling on process shutdown.
    pub shutdown_policy: DrainPolicy,

    /// Upper bound on graceful shutdown of all connections, in seconds.
    pub shutdown_timeout_secs: u64,

    /// Pending requests buffered per device task.
    pub mailbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 5_000,
            keep_alive_interval_secs: 30,
            keep_alive_timeout_ms: 2_000,
            keep_alive_failure_threshold: 3,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            queue_capacity: 50,
            queue_full_policy: QueueFullPolicy::RejectNew,
            queue_drain_delay_ms: 100,
            max_queue_wait_secs: 120,
            max_command_attempts: 3,
            idle_timeout_secs: 60 * 60,
            cleanup_interval_secs: 30 * 60,
            disconnect_policy: DrainPolicy::Drain,
            shutdown_policy: DrainPolicy::Drain,
            shutdown_timeout_secs: 10,
            mailbox_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn queue_drain_delay(&self) -> Duration {
        Duration::from_millis(self.queue_drain_delay_ms)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_secs(self.max_queue_wait_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Per-call timeout in milliseconds (0 disables the breaker's own timeout).
    pub timeout_ms: u64,

    /// Error percentage within the rolling window that opens the circuit.
    pub error_threshold_percentage: u32,

    /// Minimum calls within the rolling window before the circuit may open.
    pub volume_threshold: u32,

    /// Time the circuit stays open before a half-open probe, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Length of the rolling statistics window in milliseconds.
    pub rolling_window_ms: u64,

    /// Number of buckets the rolling window is split into.
    pub rolling_buckets: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            error_threshold_percentage: 50,
            volume_threshold: 5,
            reset_timeout_ms: 30_000,
            rolling_window_ms: 10_000,
            rolling_buckets: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window_ms)
    }
}

/// One named admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitTier {
    /// Requests admitted per window.
    pub max_requests: u32,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitTier {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Tier used when a caller names an unknown tier.
    pub default_tier: String,

    /// Named tiers.
    pub tiers: BTreeMap<String, RateLimitTier>,

    /// Interval between sweeps of idle buckets, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert("default".to_string(), RateLimitTier::new(100, 60_000));
        tiers.insert("hardware".to_string(), RateLimitTier::new(60, 60_000));
        tiers.insert("sensitive".to_string(), RateLimitTier::new(10, 60_000));

        Self {
            enabled: true,
            default_tier: "default".to_string(),
            tiers,
            sweep_interval_secs: 300,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the periodic health monitor.
    pub enabled: bool,

    /// Interval between monitoring passes in seconds.
    pub interval_secs: u64,

    /// Per-device probe timeout in milliseconds.
    pub probe_timeout_ms: u64,

    /// Maximum probes in flight at once.
    pub max_concurrency: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            probe_timeout_ms: 3_000,
            max_concurrency: 8,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin status API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// External HTTP API reached through a circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Breaker and lookup name.
    pub name: String,

    /// Base URL requests are resolved against.
    pub base_url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    5_000
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: LinkConfig = toml::from_str(
            r#"
            [[devices]]
            id = "matrix-1"
            address = "10.0.0.20:5000"
            protocol = "matrix-line"
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.connections.queue_capacity, 50);
        assert_eq!(config.connections.queue_drain_delay(), Duration::from_millis(100));
        assert_eq!(config.circuit_breaker.volume_threshold, 5);
        assert_eq!(config.rate_limit.default_tier, "default");
    }

    #[test]
    fn policies_parse_from_snake_case() {
        let config: LinkConfig = toml::from_str(
            r#"
            [connections]
            queue_full_policy = "drop_oldest"
            shutdown_policy = "reject"

            [circuit_breakers."upstream:scores"]
            timeout_ms = 0
            reset_timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.connections.queue_full_policy, QueueFullPolicy::DropOldest);
        assert_eq!(config.connections.shutdown_policy, DrainPolicy::Reject);
        let scores = &config.circuit_breakers["upstream:scores"];
        assert_eq!(scores.call_timeout(), None);
        assert_eq!(scores.reset_timeout(), Duration::from_secs(5));
        assert_eq!(scores.error_threshold_percentage, 50);
    }
}
