//! Metrics collection and exposition.
//!
//! # Metrics
//! - `device_commands_total` (counter): commands by device and outcome
//! - `device_command_duration_seconds` (histogram): send-to-reply latency
//! - `device_connection_state` (gauge): current state code per device
//! - `device_reconnects_total` (counter): reconnect attempts per device
//! - `device_queue_depth` (gauge): queued commands per device
//! - `circuit_breaker_transitions_total` (counter): state changes by breaker and target state
//! - `circuit_breaker_rejections_total` (counter): fast-failed calls per breaker
//! - `rate_limit_denied_total` (counter): denials per tier
//! - `health_check_passes_total` (counter), `health_devices_unhealthy` (gauge)
//! - `device_health` (gauge): 1=healthy, 0=unhealthy
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Labels for device, breaker, tier; never for payloads

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::connection::state::ConnectionState;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_command(device_id: &str, outcome: &'static str, latency: Duration) {
    counter!("device_commands_total", "device" => device_id.to_string(), "outcome" => outcome).increment(1);
    histogram!("device_command_duration_seconds", "device" => device_id.to_string()).record(latency.as_secs_f64());
}

pub fn record_connection_state(device_id: &str, state: ConnectionState) {
    gauge!("device_connection_state", "device" => device_id.to_string()).set(state as u8 as f64);
}

pub fn record_reconnect(device_id: &str) {
    counter!("device_reconnects_total", "device" => device_id.to_string()).increment(1);
}

pub fn record_queue_depth(device_id: &str, depth: usize) {
    gauge!("device_queue_depth", "device" => device_id.to_string()).set(depth as f64);
}

pub fn record_breaker_transition(name: &str, to: CircuitState) {
    counter!("circuit_breaker_transitions_total", "breaker" => name.to_string(), "state" => to.as_str())
        .increment(1);
}

pub fn record_breaker_rejected(name: &str) {
    counter!("circuit_breaker_rejections_total", "breaker" => name.to_string()).increment(1);
}

pub fn record_rate_limited(tier: &str) {
    counter!("rate_limit_denied_total", "tier" => tier.to_string()).increment(1);
}

pub fn record_health_pass(healthy: usize, unhealthy: usize) {
    counter!("health_check_passes_total").increment(1);
    gauge!("health_devices_unhealthy").set(unhealthy as f64);
    gauge!("health_devices_healthy").set(healthy as f64);
}

pub fn record_device_health(device_id: &str, healthy: bool) {
    gauge!("device_health", "device" => device_id.to_string()).set(if healthy { 1.0 } else { 0.0 });
}
