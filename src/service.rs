//! The `DeviceLink` service: process-scoped state tying the layer together.
//!
//! # Data Flow
//! ```text
//! execute_device_command(device_id, command, options)
//!     → RateLimiter (caller identity + tier, if given)
//!     → CircuitBreaker "device:<id>"
//!     → ConnectionManager → device task → ProtocolAdapter transport
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::LinkConfig;
use crate::connection::{CommandOptions, ConnectionManager, ConnectionStats, ConnectionStatusSummary};
use crate::devices::{DeviceDescriptor, DeviceRegistry, RegistryChange};
use crate::error::LinkError;
use crate::health::{DeviceProbe, HealthMonitor, HealthSnapshot, HealthStats};
use crate::protocol::{AdapterRegistry, Command, Response};
use crate::resilience::registry::{device_breaker_name, upstream_breaker_name};
use crate::resilience::{BreakerStatus, CircuitBreakerRegistry, CircuitState};
use crate::security::{RateLimitDecision, RateLimiter};
use crate::upstream::{HttpUpstream, UpstreamResponse};

/// Top-level service summary.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub devices: usize,
    pub connections: ConnectionStats,
    pub open_breakers: Vec<String>,
    pub health: HealthStats,
}

pub struct DeviceLink {
    config: Arc<LinkConfig>,
    devices: Arc<DeviceRegistry>,
    adapters: Arc<AdapterRegistry>,
    connections: Arc<ConnectionManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    upstreams: BTreeMap<String, Arc<HttpUpstream>>,
}

impl DeviceLink {
    /// Build every component from configuration. Nothing is spawned here.
    pub fn new(config: LinkConfig, adapters: AdapterRegistry) -> Result<Self, LinkError> {
        let config = Arc::new(config);
        let adapters = Arc::new(adapters);
        let devices = Arc::new(DeviceRegistry::new(config.devices.clone()));

        let connections = Arc::new(ConnectionManager::new(
            config.connections.clone(),
            adapters.clone(),
            devices.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            config.circuit_breakers.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let prober: Arc<dyn DeviceProbe> = connections.clone();
        let health = Arc::new(HealthMonitor::new(devices.clone(), prober, config.health_check.clone()));

        let mut upstreams = BTreeMap::new();
        for upstream in &config.upstreams {
            let breaker = breakers.get_or_create(&upstream_breaker_name(&upstream.name));
            upstreams.insert(upstream.name.clone(), Arc::new(HttpUpstream::new(upstream, breaker)?));
        }

        let link = Self {
            config,
            devices,
            adapters,
            connections,
            breakers,
            rate_limiter,
            health,
            upstreams,
        };
        link.register_devices(&link.devices.all());

        tracing::info!(
            devices = link.devices.len(),
            protocols = ?link.adapters.kinds(),
            upstreams = link.upstreams.len(),
            "Device link initialised"
        );
        Ok(link)
    }

    fn register_devices(&self, devices: &[DeviceDescriptor]) {
        for device in devices {
            self.breakers.get_or_create(&device_breaker_name(&device.id));
            if !self.adapters.contains(&device.protocol) {
                tracing::warn!(
                    device_id = %device.id,
                    protocol = %device.protocol,
                    "No adapter registered for device protocol"
                );
            }
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Send a command to a device through admission control and its breaker.
    pub async fn execute_device_command(
        &self,
        device_id: &str,
        command: Command,
        options: CommandOptions,
    ) -> Result<Response, LinkError> {
        if let Some(caller) = &options.caller {
            self.rate_limiter.check(&caller.identifier, &caller.tier)?;
        }
        if self.devices.get(device_id).is_none() {
            return Err(LinkError::UnknownDevice(device_id.to_string()));
        }

        let breaker = self.breakers.get_or_create(&device_breaker_name(device_id));
        let connections = &self.connections;
        let options = &options;
        breaker
            .fire(|| connections.execute_command(device_id, command, options))
            .await
            .map_err(LinkError::from)
    }

    /// Admission decision without executing anything (for callers that render headers).
    pub fn check_rate_limit(&self, identifier: &str, tier: &str) -> RateLimitDecision {
        self.rate_limiter.allow(identifier, tier)
    }

    pub fn get_connection_status(&self, device_id: Option<&str>) -> ConnectionStatusSummary {
        self.connections.status(device_id)
    }

    pub fn get_circuit_breaker_status(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers.status()
    }

    pub fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        self.health.snapshot()
    }

    pub fn health_stats(&self) -> HealthStats {
        self.health.stats()
    }

    pub async fn run_health_check(&self) -> Arc<HealthSnapshot> {
        self.health.run_health_check().await
    }

    pub fn upstream(&self, name: &str) -> Option<&Arc<HttpUpstream>> {
        self.upstreams.get(name)
    }

    /// GET JSON from a configured upstream.
    pub async fn fetch_upstream(&self, name: &str, path: &str) -> Result<UpstreamResponse, LinkError> {
        let upstream = self.upstreams.get(name).ok_or_else(|| LinkError::Upstream {
            name: name.to_string(),
            status: None,
            message: "upstream not configured".into(),
        })?;
        upstream.get_json(path).await
    }

    pub fn status(&self) -> ServiceStatus {
        let open_breakers = self
            .breakers
            .status()
            .into_iter()
            .filter(|(_, status)| status.state != CircuitState::Closed)
            .map(|(name, _)| name)
            .collect();

        ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            devices: self.devices.len(),
            connections: self.connections.status(None).stats,
            open_breakers,
            health: self.health.stats(),
        }
    }

    /// Replace the device list. Connections to removed or re-addressed devices are closed.
    pub async fn reload_devices(&self, devices: Vec<DeviceDescriptor>) -> RegistryChange {
        let change = self.devices.replace(devices);
        self.register_devices(&self.devices.all());

        let mut stale = change.removed.clone();
        stale.extend(change.changed.iter().cloned());
        self.connections.forget_devices(&stale).await;

        tracing::info!(
            added = change.added.len(),
            removed = change.removed.len(),
            changed = change.changed.len(),
            "Device registry reloaded"
        );
        change
    }

    /// Stop accepting commands and close every device connection.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}
