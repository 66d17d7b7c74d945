//! The probing seam between the health monitor and the connection layer.

use std::time::Duration;

use async_trait::async_trait;

use crate::connection::ConnectionManager;
use crate::devices::DeviceDescriptor;
use crate::error::LinkError;

/// Something that can check whether a device answers.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Probe `descriptor`; returns the round-trip latency.
    async fn probe(&self, descriptor: &DeviceDescriptor, timeout: Duration) -> Result<Duration, LinkError>;
}

#[async_trait]
impl DeviceProbe for ConnectionManager {
    async fn probe(&self, descriptor: &DeviceDescriptor, timeout: Duration) -> Result<Duration, LinkError> {
        self.probe_device(descriptor, timeout).await
    }
}
