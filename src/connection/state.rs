//! Connection state machine and lock-free status tracking.
//!
//! # States
//! ```text
//! Disconnected → Connecting → Connected
//! Connected → Reconnecting: transport error, timeout, or keep-alive threshold
//! Reconnecting → Connected: backoff attempt succeeds (queue drains)
//! Reconnecting → Failed: reconnect attempts exhausted (queue rejected)
//! Failed → Connecting: a new command or connect request arrives
//! ```
//!
//! # Design Decisions
//! - Only the device task writes; status readers never block it
//! - Idle time is measured on the tokio clock so it follows paused test time

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

use crate::devices::DeviceDescriptor;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, atomically updated view of one device connection.
#[derive(Debug)]
pub struct DeviceStatus {
    pub descriptor: DeviceDescriptor,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    queue_len: AtomicUsize,
    commands_sent: AtomicU64,
    last_activity_unix_ms: AtomicU64,
    /// Milliseconds since `created` at the last activity.
    last_activity_offset_ms: AtomicU64,
    created: Instant,
}

impl DeviceStatus {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            consecutive_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            queue_len: AtomicUsize::new(0),
            commands_sent: AtomicU64::new(0),
            last_activity_unix_ms: AtomicU64::new(unix_millis()),
            last_activity_offset_ms: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from(self.state.swap(state as u8, Ordering::AcqRel))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    /// Record command activity on the device.
    pub(crate) fn touch(&self) {
        let offset = self.created.elapsed().as_millis() as u64;
        self.last_activity_offset_ms.store(offset, Ordering::Relaxed);
        self.last_activity_unix_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Time since the last command activity.
    pub fn idle_for(&self) -> Duration {
        let offset = Duration::from_millis(self.last_activity_offset_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(offset)
    }

    pub fn snapshot(&self) -> DeviceStatusSnapshot {
        DeviceStatusSnapshot {
            device_id: self.descriptor.id.clone(),
            address: self.descriptor.address.clone(),
            protocol: self.descriptor.protocol.to_string(),
            state: self.state(),
            last_activity: self.last_activity_unix_ms.load(Ordering::Relaxed),
            idle_secs: self.idle_for().as_secs(),
            consecutive_failures: self.consecutive_failures(),
            reconnect_attempts: self.reconnect_attempts(),
            queued_commands: self.queue_len(),
            commands_sent: self.commands_sent(),
        }
    }
}

/// Serializable point-in-time copy of a `DeviceStatus`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatusSnapshot {
    pub device_id: String,
    pub address: String,
    pub protocol: String,
    pub state: ConnectionState,
    /// Unix timestamp (ms) of the last command activity.
    pub last_activity: u64,
    pub idle_secs: u64,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub queued_commands: usize,
    pub commands_sent: u64,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolKind;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
        assert_eq!(ConnectionState::from(42), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_follows_activity() {
        let status = DeviceStatus::new(DeviceDescriptor::new("ir-1", "10.0.0.30:4998", ProtocolKind::IR_BLASTER));

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(status.idle_for() >= Duration::from_secs(90));

        status.record_sent();
        assert!(status.idle_for() < Duration::from_secs(1));
        assert_eq!(status.commands_sent(), 1);
    }
}
