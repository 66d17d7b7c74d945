//! Connection manager: the table of device tasks.
//!
//! The manager only routes. Every per-device decision (connect, queue, reconnect,
//! drain) is made by that device's task; the table itself is a `DashMap` so lookups for
//! different devices never contend on a global lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ConnectionConfig;
use crate::connection::device::{CloseReason, ConnectionHandle, DeviceTask};
use crate::connection::state::{ConnectionState, DeviceStatus, DeviceStatusSnapshot};
use crate::devices::{DeviceDescriptor, DeviceRegistry};
use crate::error::LinkError;
use crate::protocol::{AdapterRegistry, Command, Response};

/// Identity used for admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identifier: String,
    pub tier: String,
}

/// Per-command options.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Park the command while the device is unreachable instead of failing fast.
    pub allow_queue: bool,
    /// Per-send timeout; the configured command timeout when `None`.
    pub timeout: Option<Duration>,
    /// Rate-limit identity; unlimited when `None`.
    pub caller: Option<Caller>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            allow_queue: true,
            timeout: None,
            caller: None,
        }
    }
}

impl CommandOptions {
    pub fn no_queue(mut self) -> Self {
        self.allow_queue = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn for_caller(mut self, identifier: impl Into<String>, tier: impl Into<String>) -> Self {
        self.caller = Some(Caller {
            identifier: identifier.into(),
            tier: tier.into(),
        });
        self
    }
}

/// Aggregate connection counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub reconnecting: usize,
    pub failed: usize,
    pub disconnected: usize,
    pub queued_commands: usize,
}

/// Result of `ConnectionManager::status`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatusSummary {
    pub devices: BTreeMap<String, DeviceStatusSnapshot>,
    pub stats: ConnectionStats,
}

/// A task stays in the table while it closes, so no second task (and transport)
/// for the same device can start until the first has let go of its transport.
struct DeviceEntry {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
    closing: bool,
}

/// What `handle_for` found for a device id.
enum Slot {
    Ready(ConnectionHandle),
    Closing(ConnectionHandle),
    Outdated(ConnectionHandle),
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    adapters: Arc<AdapterRegistry>,
    devices: Arc<DeviceRegistry>,
    connections: DashMap<String, DeviceEntry>,
    accepting: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, adapters: Arc<AdapterRegistry>, devices: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            adapters,
            devices,
            connections: DashMap::new(),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// Number of device tasks currently in the table.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn ensure_accepting(&self) -> Result<(), LinkError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::ShuttingDown)
        }
    }

    /// Handle to the task serving `descriptor`, spawning one if needed.
    ///
    /// A task that is closing is waited out first. A task serving an outdated
    /// descriptor for the same id is closed, then replaced.
    async fn handle_for(&self, descriptor: &DeviceDescriptor) -> Result<ConnectionHandle, LinkError> {
        let adapter = self.adapters.get(&descriptor.protocol)?;
        let spawn = || {
            let status = Arc::new(DeviceStatus::new(descriptor.clone()));
            let (handle, task) = DeviceTask::spawn(status, adapter.clone(), self.config.clone());
            DeviceEntry {
                handle,
                task,
                closing: false,
            }
        };

        loop {
            let slot = match self.connections.entry(descriptor.id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if entry.handle.is_closed() {
                        // Checked under the shard lock so shutdown cannot miss the new task.
                        self.ensure_accepting()?;
                        let fresh = spawn();
                        let handle = fresh.handle.clone();
                        occupied.insert(fresh);
                        Slot::Ready(handle)
                    } else if entry.closing {
                        Slot::Closing(entry.handle.clone())
                    } else if entry.handle.status().descriptor == *descriptor {
                        Slot::Ready(entry.handle.clone())
                    } else {
                        entry.closing = true;
                        Slot::Outdated(entry.handle.clone())
                    }
                }
                Entry::Vacant(vacant) => {
                    self.ensure_accepting()?;
                    let fresh = spawn();
                    let handle = fresh.handle.clone();
                    vacant.insert(fresh);
                    tracing::debug!(device_id = %descriptor.id, protocol = %descriptor.protocol, "Device task created");
                    Slot::Ready(handle)
                }
            };

            match slot {
                Slot::Ready(handle) => return Ok(handle),
                Slot::Closing(handle) => handle.closed().await,
                Slot::Outdated(handle) => {
                    tracing::info!(device_id = %descriptor.id, "Device descriptor changed, replacing connection");
                    handle
                        .close(crate::config::DrainPolicy::Reject, CloseReason::Replaced)
                        .await;
                    handle.closed().await;
                }
            }
        }
    }

    /// Return a connected handle for `descriptor`, establishing the transport if needed.
    ///
    /// Concurrent calls for the same device share one connect attempt and its outcome.
    pub async fn get_or_create_connection(&self, descriptor: &DeviceDescriptor) -> Result<ConnectionHandle, LinkError> {
        self.ensure_accepting()?;
        let handle = self.handle_for(descriptor).await?;
        handle.connect().await?;
        Ok(handle)
    }

    /// Send `command` to a registered device.
    pub async fn execute_command(
        &self,
        device_id: &str,
        command: Command,
        options: &CommandOptions,
    ) -> Result<Response, LinkError> {
        self.ensure_accepting()?;
        let descriptor = self
            .devices
            .get(device_id)
            .ok_or_else(|| LinkError::UnknownDevice(device_id.to_string()))?;

        let handle = self.handle_for(&descriptor).await?;
        let timeout = options.timeout.unwrap_or_else(|| self.config.command_timeout());
        handle.execute(command, options.allow_queue, timeout).await
    }

    /// Close one device's connection, draining or rejecting its queue per
    /// `disconnect_policy`. Returns whether this call closed a connection.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        self.close_device(device_id, CloseReason::Disconnect, |_| true).await
    }

    /// Mark the device's entry closing if `should_close` holds, close the task, and only
    /// then drop the entry from the table.
    async fn close_device<F>(&self, device_id: &str, reason: CloseReason, should_close: F) -> bool
    where
        F: Fn(&DeviceEntry) -> bool,
    {
        let handle = match self.connections.get_mut(device_id) {
            Some(mut entry) if !entry.closing && should_close(entry.value()) => {
                entry.closing = true;
                entry.handle.clone()
            }
            _ => return false,
        };

        if reason == CloseReason::Idle {
            tracing::info!(
                device_id = %device_id,
                idle_secs = handle.status().idle_for().as_secs(),
                "Closing idle connection"
            );
        }
        handle.close(self.config.disconnect_policy, reason).await;

        if let Some((_, entry)) = self
            .connections
            .remove_if(device_id, |_, entry| entry.handle.same_task(&handle))
        {
            if let Err(e) = entry.task.await {
                tracing::warn!(device_id = %device_id, error = %e, "Device task ended abnormally");
            }
        }
        true
    }

    /// Close connections idle for at least `idle_timeout`, and forget tasks that exited.
    /// Returns the number of connections removed.
    pub async fn cleanup_stale_connections(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let is_stale = |entry: &DeviceEntry| {
            entry.handle.is_closed()
                || (entry.handle.status().idle_for() >= idle_timeout && entry.handle.status().queue_len() == 0)
        };

        let candidates: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for device_id in candidates {
            // Re-checked under the shard lock; the device may have been used meanwhile.
            if self.close_device(&device_id, CloseReason::Idle, &is_stale).await {
                removed += 1;
            }
        }
        removed
    }

    /// Periodically run `cleanup_stale_connections` until shutdown.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.cleanup_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);

        tracing::info!(interval_secs = period.as_secs(), "Idle connection cleanup started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup_stale_connections().await;
                    if removed > 0 {
                        tracing::info!(removed, remaining = self.connections.len(), "Idle connections cleaned up");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Idle connection cleanup shutting down");
                    break;
                }
            }
        }
    }

    /// Status of one device (or all) plus aggregate counts over every connection.
    pub fn status(&self, device_id: Option<&str>) -> ConnectionStatusSummary {
        let mut devices = BTreeMap::new();
        let mut stats = ConnectionStats::default();

        for entry in self.connections.iter() {
            let snapshot = entry.handle.status().snapshot();
            stats.total += 1;
            stats.queued_commands += snapshot.queued_commands;
            match snapshot.state {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Reconnecting => stats.reconnecting += 1,
                ConnectionState::Failed => stats.failed += 1,
                ConnectionState::Disconnected => stats.disconnected += 1,
            }
            if device_id.map_or(true, |id| id == entry.key()) {
                devices.insert(entry.key().clone(), snapshot);
            }
        }

        ConnectionStatusSummary { devices, stats }
    }

    /// Probe a device and return the round-trip latency.
    ///
    /// The probe always goes through the device's task, so it never holds a transport
    /// alongside the one commands use. A task with no connection opens one just for the
    /// probe and closes it again.
    pub async fn probe_device(&self, descriptor: &DeviceDescriptor, timeout: Duration) -> Result<Duration, LinkError> {
        self.ensure_accepting()?;
        let handle = self.handle_for(descriptor).await?;
        handle.probe(timeout).await
    }

    /// Disconnect devices that were removed from, or changed in, the registry.
    pub async fn forget_devices(&self, device_ids: &[String]) {
        for device_id in device_ids {
            if self.disconnect(device_id).await {
                tracing::info!(device_id = %device_id, "Connection closed after registry change");
            }
        }
    }

    /// Stop accepting commands, then close every connection per `shutdown_policy`,
    /// bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let mut entries: Vec<DeviceEntry> = Vec::new();
        loop {
            let ids: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
            if ids.is_empty() {
                break;
            }
            entries.extend(
                ids.iter()
                    .filter_map(|id| self.connections.remove(id).map(|(_, entry)| entry)),
            );
        }

        tracing::info!(
            connections = entries.len(),
            policy = ?self.config.shutdown_policy,
            "Closing device connections"
        );

        let policy = self.config.shutdown_policy;
        let closing = futures_util::future::join_all(
            entries
                .iter()
                .map(|entry| entry.handle.close(policy, CloseReason::Shutdown)),
        );
        if time::timeout(self.config.shutdown_timeout(), closing).await.is_err() {
            tracing::warn!("Connection shutdown timed out, aborting remaining device tasks");
        }

        for entry in entries {
            if !entry.task.is_finished() {
                entry.task.abort();
            }
            let _ = entry.task.await;
        }
    }
}
