//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, percentages within 1..=100)
//! - Check referential integrity (default rate-limit tier exists)
//! - Detect duplicate device ids and upstream names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LinkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, including on reload

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{CircuitBreakerConfig, LinkConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: String },

    #[error("{field}: {message}")]
    OutOfRange { field: String, message: String },

    #[error("{field} must not be empty")]
    Empty { field: String },

    #[error("duplicate device id '{0}'")]
    DuplicateDevice(String),

    #[error("duplicate upstream name '{0}'")]
    DuplicateUpstream(String),

    #[error("default rate limit tier '{0}' is not defined")]
    UnknownDefaultTier(String),

    #[error("{field}: invalid address '{value}'")]
    InvalidAddress { field: String, value: String },

    #[error("upstream '{name}': invalid base_url: {reason}")]
    InvalidUrl { name: String, reason: String },
}

fn non_zero(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::Zero {
            field: field.to_string(),
        });
    }
}

fn socket_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

fn validate_breaker(errors: &mut Vec<ValidationError>, prefix: &str, breaker: &CircuitBreakerConfig) {
    if !(1..=100).contains(&breaker.error_threshold_percentage) {
        errors.push(ValidationError::OutOfRange {
            field: format!("{}.error_threshold_percentage", prefix),
            message: "must be between 1 and 100".into(),
        });
    }
    non_zero(errors, &format!("{}.reset_timeout_ms", prefix), breaker.reset_timeout_ms);
    non_zero(errors, &format!("{}.rolling_buckets", prefix), breaker.rolling_buckets as u64);
    if breaker.rolling_window_ms < breaker.rolling_buckets as u64 {
        errors.push(ValidationError::OutOfRange {
            field: format!("{}.rolling_window_ms", prefix),
            message: "must be at least one millisecond per bucket".into(),
        });
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &LinkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let conn = &config.connections;
    non_zero(&mut errors, "connections.connect_timeout_ms", conn.connect_timeout_ms);
    non_zero(&mut errors, "connections.command_timeout_ms", conn.command_timeout_ms);
    non_zero(&mut errors, "connections.keep_alive_interval_secs", conn.keep_alive_interval_secs);
    non_zero(&mut errors, "connections.keep_alive_timeout_ms", conn.keep_alive_timeout_ms);
    non_zero(
        &mut errors,
        "connections.keep_alive_failure_threshold",
        conn.keep_alive_failure_threshold as u64,
    );
    non_zero(&mut errors, "connections.queue_capacity", conn.queue_capacity as u64);
    non_zero(&mut errors, "connections.max_command_attempts", conn.max_command_attempts as u64);
    non_zero(&mut errors, "connections.mailbox_capacity", conn.mailbox_capacity as u64);
    non_zero(&mut errors, "connections.cleanup_interval_secs", conn.cleanup_interval_secs);
    if conn.reconnect_base_delay_ms > conn.reconnect_max_delay_ms {
        errors.push(ValidationError::OutOfRange {
            field: "connections.reconnect_base_delay_ms".into(),
            message: "must not exceed reconnect_max_delay_ms".into(),
        });
    }

    validate_breaker(&mut errors, "circuit_breaker", &config.circuit_breaker);
    for (name, breaker) in &config.circuit_breakers {
        validate_breaker(&mut errors, &format!("circuit_breakers.{}", name), breaker);
    }

    let limits = &config.rate_limit;
    if limits.enabled && !limits.tiers.contains_key(&limits.default_tier) {
        errors.push(ValidationError::UnknownDefaultTier(limits.default_tier.clone()));
    }
    for (name, tier) in &limits.tiers {
        non_zero(&mut errors, &format!("rate_limit.tiers.{}.max_requests", name), tier.max_requests as u64);
        non_zero(&mut errors, &format!("rate_limit.tiers.{}.window_ms", name), tier.window_ms);
    }

    let health = &config.health_check;
    if health.enabled {
        non_zero(&mut errors, "health_check.interval_secs", health.interval_secs);
        non_zero(&mut errors, "health_check.probe_timeout_ms", health.probe_timeout_ms);
        non_zero(&mut errors, "health_check.max_concurrency", health.max_concurrency as u64);
    }

    if config.observability.metrics_enabled {
        socket_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        socket_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::Empty {
                field: "admin.api_key".into(),
            });
        }
    }

    let mut ids = HashSet::new();
    for device in &config.devices {
        if device.id.is_empty() {
            errors.push(ValidationError::Empty {
                field: "devices.id".into(),
            });
        } else if !ids.insert(device.id.as_str()) {
            errors.push(ValidationError::DuplicateDevice(device.id.clone()));
        }
        if device.address.is_empty() {
            errors.push(ValidationError::Empty {
                field: format!("devices.{}.address", device.id),
            });
        }
    }

    let mut names = HashSet::new();
    for upstream in &config.upstreams {
        if !names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::DuplicateUpstream(upstream.name.clone()));
        }
        if let Err(e) = url::Url::parse(&upstream.base_url) {
            errors.push(ValidationError::InvalidUrl {
                name: upstream.name.clone(),
                reason: e.to_string(),
            });
        }
        non_zero(&mut errors, &format!("upstreams.{}.timeout_ms", upstream.name), upstream.timeout_ms);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RateLimitTier, UpstreamConfig};
    use crate::devices::DeviceDescriptor;
    use crate::protocol::ProtocolKind;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&LinkConfig::default()), Ok(()));
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let mut config = LinkConfig::default();
        config.devices = vec![
            DeviceDescriptor::new("matrix-1", "10.0.0.20:5000", ProtocolKind::MATRIX_LINE),
            DeviceDescriptor::new("matrix-1", "10.0.0.21:5000", ProtocolKind::MATRIX_LINE),
        ];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::DuplicateDevice("matrix-1".into())]);
    }

    #[test]
    fn missing_default_tier_and_bad_url() {
        let mut config = LinkConfig::default();
        config.rate_limit.default_tier = "standard".into();
        config.rate_limit.tiers.insert("zero".into(), RateLimitTier::new(0, 1_000));
        config.upstreams.push(UpstreamConfig {
            name: "scores".into(),
            base_url: "not a url".into(),
            timeout_ms: 1_000,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::UnknownDefaultTier("standard".into())));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidUrl { .. })));
    }

    #[test]
    fn breaker_overrides_are_checked() {
        let mut config = LinkConfig::default();
        config.circuit_breakers.insert(
            "device:ir-1".into(),
            CircuitBreakerConfig {
                error_threshold_percentage: 0,
                ..Default::default()
            },
        );

        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(&errors[0], ValidationError::OutOfRange { field, .. } if field.starts_with("circuit_breakers.device:ir-1")));
    }
}
