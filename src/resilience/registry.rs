//! Named circuit breakers, one per dependency.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::resilience::circuit_breaker::{BreakerStatus, CircuitBreaker};

/// Breaker name for a device.
pub fn device_breaker_name(device_id: &str) -> String {
    format!("device:{}", device_id)
}

/// Breaker name for an HTTP upstream.
pub fn upstream_breaker_name(upstream: &str) -> String {
    format!("upstream:{}", upstream)
}

/// Process-wide breaker table. Breakers are created on first use and live until exit.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: BTreeMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig, overrides: BTreeMap<String, CircuitBreakerConfig>) -> Self {
        Self {
            defaults,
            overrides,
            breakers: DashMap::new(),
        }
    }

    /// Effective settings for `name`.
    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides.get(name).unwrap_or(&self.defaults).clone()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config_for(name)))
            })
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.value().clone())
    }

    /// Status of every breaker, ordered by name.
    pub fn status(&self) -> BTreeMap<String, BreakerStatus> {
        // Collect first so no shard lock is held while each breaker locks itself.
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        breakers
            .into_iter()
            .map(|(name, breaker)| (name, breaker.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
