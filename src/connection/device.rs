//! Device task: the single owner of one device's transport and command queue.
//!
//! Every operation on a device is a message to its task, so commands, probes and
//! reconnects for one device are strictly serialized while different devices run
//! independently.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::config::{ConnectionConfig, DrainPolicy};
use crate::connection::queue::{CommandQueue, CommandReply, PushOutcome, QueuedCommand};
use crate::connection::state::{ConnectionState, DeviceStatus};
use crate::error::{ConnectionError, LinkError, TransportError};
use crate::observability::metrics;
use crate::protocol::{Command, ProtocolAdapter, Response, Transport};
use crate::resilience::ReconnectPolicy;

/// Why a device task is being closed; decides the error queued callers receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Disconnect,
    Idle,
    Replaced,
    Shutdown,
}

pub(crate) enum DeviceMessage {
    Connect {
        requested_at: Instant,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Execute {
        command: Command,
        allow_queue: bool,
        timeout: Duration,
        requested_at: Instant,
        reply: CommandReply,
    },
    Probe {
        timeout: Duration,
        reply: oneshot::Sender<Result<Duration, LinkError>>,
    },
    Close {
        policy: DrainPolicy,
        reason: CloseReason,
        reply: oneshot::Sender<()>,
    },
}

impl DeviceMessage {
    fn reject(self, err: LinkError) {
        match self {
            DeviceMessage::Connect { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            DeviceMessage::Execute { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            DeviceMessage::Probe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            DeviceMessage::Close { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Cheap, cloneable handle to a running device task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    status: Arc<DeviceStatus>,
    tx: mpsc::Sender<DeviceMessage>,
}

impl ConnectionHandle {
    pub fn device_id(&self) -> &str {
        self.status.device_id()
    }

    pub fn status(&self) -> &Arc<DeviceStatus> {
        &self.status
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    /// The task has exited and will accept no more work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the task has exited.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }

    pub(crate) fn same_task(&self, other: &ConnectionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Make sure a transport is open, joining an attempt already in flight.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let requested_at = Instant::now();
        self.request(|reply| DeviceMessage::Connect { requested_at, reply })
            .await
    }

    /// Send `command`, waiting for the device's reply.
    ///
    /// With `allow_queue`, a command that cannot be sent because the device is
    /// unreachable is parked and resolves once it is actually sent after reconnection.
    pub async fn execute(&self, command: Command, allow_queue: bool, timeout: Duration) -> Result<Response, LinkError> {
        let requested_at = Instant::now();
        self.request(|reply| DeviceMessage::Execute {
            command,
            allow_queue,
            timeout,
            requested_at,
            reply,
        })
        .await
    }

    /// Probe the device through its task; returns the probe latency. A task with no
    /// transport and no connection in progress opens one just for the probe.
    pub async fn probe(&self, timeout: Duration) -> Result<Duration, LinkError> {
        self.request(|reply| DeviceMessage::Probe { timeout, reply }).await
    }

    pub(crate) async fn close(&self, policy: DrainPolicy, reason: CloseReason) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(DeviceMessage::Close { policy, reason, reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, LinkError>>) -> DeviceMessage,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        let disconnected = || LinkError::Disconnected {
            device_id: self.device_id().to_string(),
        };

        self.tx.send(build(reply)).await.map_err(|_| disconnected())?;
        rx.await.map_err(|_| disconnected())?
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// State owned by one device task.
pub(crate) struct DeviceTask {
    status: Arc<DeviceStatus>,
    adapter: Arc<dyn ProtocolAdapter>,
    config: ConnectionConfig,
    reconnect_policy: ReconnectPolicy,
    rx: mpsc::Receiver<DeviceMessage>,
    transport: Option<Box<dyn Transport>>,
    queue: CommandQueue,
    /// Completion time and error of the last failed connect attempt.
    last_failure: Option<(Instant, LinkError)>,
    next_reconnect: Option<Instant>,
    next_keep_alive: Instant,
    probe_failures: u32,
}

impl DeviceTask {
    pub(crate) fn spawn(
        status: Arc<DeviceStatus>,
        adapter: Arc<dyn ProtocolAdapter>,
        config: ConnectionConfig,
    ) -> (ConnectionHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));

        let task = DeviceTask {
            status: status.clone(),
            adapter,
            reconnect_policy: ReconnectPolicy::from_config(&config),
            queue: CommandQueue::new(config.queue_capacity, config.queue_full_policy),
            next_keep_alive: Instant::now() + config.keep_alive_interval(),
            config,
            rx,
            transport: None,
            last_failure: None,
            next_reconnect: None,
            probe_failures: 0,
        };

        let join = tokio::spawn(task.run());
        (ConnectionHandle { status, tx }, join)
    }

    fn device_id(&self) -> String {
        self.status.device_id().to_string()
    }

    async fn run(mut self) {
        tracing::debug!(device_id = %self.status.device_id(), "Device task started");

        loop {
            let keep_alive = self.transport.as_ref().map(|_| self.next_keep_alive);
            let reconnect = self.next_reconnect;
            let expiry = self.queue.oldest().map(|t| t + self.config.max_queue_wait());

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(DeviceMessage::Close { policy, reason, reply }) => {
                        self.close(policy, reason).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(msg) => self.handle(msg).await,
                    None => {
                        self.close(DrainPolicy::Reject, CloseReason::Replaced).await;
                        break;
                    }
                },
                _ = sleep_until_opt(keep_alive) => self.keep_alive().await,
                _ = sleep_until_opt(reconnect) => self.reconnect().await,
                _ = sleep_until_opt(expiry) => self.expire_queued(),
            }
        }

        // Anything that raced with the close still gets an answer.
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            msg.reject(LinkError::Disconnected {
                device_id: self.device_id(),
            });
        }

        tracing::debug!(device_id = %self.status.device_id(), "Device task stopped");
    }

    async fn handle(&mut self, msg: DeviceMessage) {
        match msg {
            DeviceMessage::Connect { requested_at, reply } => {
                let result = self.handle_connect(requested_at).await;
                let _ = reply.send(result);
            }
            DeviceMessage::Execute {
                command,
                allow_queue,
                timeout,
                requested_at,
                reply,
            } => {
                if reply.is_closed() {
                    tracing::debug!(device_id = %self.status.device_id(), "Caller gone, dropping command");
                    return;
                }
                self.handle_execute(command, allow_queue, timeout, requested_at, reply)
                    .await;
            }
            DeviceMessage::Probe { timeout, reply } => {
                let result = self.handle_probe(timeout).await;
                let _ = reply.send(result);
            }
            // Handled by the run loop.
            DeviceMessage::Close { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.status.set_state(state);
        if previous != state {
            tracing::info!(
                device_id = %self.status.device_id(),
                from = %previous,
                to = %state,
                "Connection state changed"
            );
            metrics::record_connection_state(self.status.device_id(), state);
        }
    }

    fn publish_queue_len(&self) {
        self.status.set_queue_len(self.queue.len());
        metrics::record_queue_depth(self.status.device_id(), self.queue.len());
    }

    /// The failure of an attempt the request was waiting on, if any.
    fn coalesced_failure(&self, requested_at: Instant) -> Option<LinkError> {
        match &self.last_failure {
            Some((completed, err)) if requested_at <= *completed => Some(err.clone()),
            _ => None,
        }
    }

    /// One transport attempt, bounded by the connect timeout. On failure the previous
    /// state is restored; callers decide what comes next.
    async fn establish(&mut self) -> Result<(), LinkError> {
        let before = self.status.state();
        if before != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        let address = self.status.descriptor.address.clone();
        let timeout = self.config.connect_timeout();
        let result = match time::timeout(timeout, self.adapter.connect(&address)).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(source)) => Err(source),
            Err(_) => Err(ConnectionError::Timeout {
                address: address.clone(),
                timeout,
            }),
        };

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.last_failure = None;
                self.next_reconnect = None;
                self.probe_failures = 0;
                self.next_keep_alive = Instant::now() + self.config.keep_alive_interval();
                self.status.reset_failures();
                self.status.set_reconnect_attempts(0);
                self.set_state(ConnectionState::Connected);
                tracing::info!(device_id = %self.status.device_id(), address = %address, "Device connected");
                Ok(())
            }
            Err(source) => {
                let failures = self.status.record_failure();
                tracing::warn!(
                    device_id = %self.status.device_id(),
                    address = %address,
                    consecutive_failures = failures,
                    error = %source,
                    "Connect attempt failed"
                );
                let err = LinkError::Connection {
                    device_id: self.device_id(),
                    source,
                };
                self.last_failure = Some((Instant::now(), err.clone()));
                self.set_state(before);
                Err(err)
            }
        }
    }

    async fn handle_connect(&mut self, requested_at: Instant) -> Result<(), LinkError> {
        match self.status.state() {
            ConnectionState::Connected => Ok(()),
            _ => {
                if let Some(err) = self.coalesced_failure(requested_at) {
                    return Err(err);
                }
                self.establish().await?;
                if !self.queue.is_empty() {
                    self.drain_queue().await;
                }
                Ok(())
            }
        }
    }

    async fn handle_execute(
        &mut self,
        command: Command,
        allow_queue: bool,
        timeout: Duration,
        requested_at: Instant,
        reply: CommandReply,
    ) {
        match self.status.state() {
            ConnectionState::Connected => self.send_now(command, allow_queue, timeout, reply).await,
            ConnectionState::Reconnecting => {
                if allow_queue {
                    self.enqueue(QueuedCommand::new(command, timeout, 0, reply));
                } else {
                    let _ = reply.send(Err(LinkError::Connection {
                        device_id: self.device_id(),
                        source: ConnectionError::NotConnected {
                            state: ConnectionState::Reconnecting,
                        },
                    }));
                }
            }
            state => {
                let connected = match self.coalesced_failure(requested_at) {
                    Some(err) => Err(err),
                    None => {
                        if state == ConnectionState::Failed {
                            tracing::info!(device_id = %self.status.device_id(), "Reconnecting failed device on demand");
                            self.status.set_reconnect_attempts(0);
                        }
                        self.establish().await
                    }
                };

                match connected {
                    Ok(()) => self.send_now(command, allow_queue, timeout, reply).await,
                    Err(_) if allow_queue => {
                        if self.status.state() != ConnectionState::Reconnecting {
                            self.status.set_reconnect_attempts(0);
                            self.schedule_reconnect();
                        }
                        self.enqueue(QueuedCommand::new(command, timeout, 0, reply));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
        }
    }

    /// Send on the live transport, bounded by `timeout` even if the adapter ignores it.
    async fn transmit(&mut self, command: &Command, timeout: Duration) -> Result<Response, TransportError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ConnectionError::NotConnected {
                state: self.status.state(),
            }
            .into());
        };

        match time::timeout(timeout, transport.send(command, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn send_now(&mut self, command: Command, allow_queue: bool, timeout: Duration, reply: CommandReply) {
        let started = Instant::now();
        let result = self.transmit(&command, timeout).await;
        let device_id = self.device_id();

        match result {
            Ok(response) => {
                self.status.record_sent();
                self.status.reset_failures();
                metrics::record_command(&device_id, "ok", started.elapsed());
                let _ = reply.send(Ok(response));
            }
            Err(TransportError::Protocol(source)) => {
                // The device answered; the link is fine.
                self.status.touch();
                metrics::record_command(&device_id, "protocol_error", started.elapsed());
                tracing::debug!(device_id = %device_id, error = %source, "Device returned a protocol error");
                let _ = reply.send(Err(LinkError::Protocol { device_id, source }));
            }
            Err(TransportError::Timeout(timeout)) => {
                metrics::record_command(&device_id, "timeout", started.elapsed());
                let _ = reply.send(Err(LinkError::Timeout {
                    operation: format!("command to {}", device_id),
                    timeout,
                }));
                self.transport_lost("command timed out").await;
            }
            Err(TransportError::Connection(source)) => {
                metrics::record_command(&device_id, "connection_error", started.elapsed());
                self.transport_lost(&source.to_string()).await;
                if allow_queue {
                    self.enqueue(QueuedCommand::new(command, timeout, 1, reply));
                } else {
                    let _ = reply.send(Err(LinkError::Connection { device_id, source }));
                }
            }
        }
    }

    async fn handle_probe(&mut self, timeout: Duration) -> Result<Duration, LinkError> {
        let state = self.status.state();
        let Some(transport) = self.transport.as_mut() else {
            if state == ConnectionState::Disconnected {
                return self.probe_transient(timeout).await;
            }
            return Err(LinkError::Connection {
                device_id: self.device_id(),
                source: ConnectionError::NotConnected { state },
            });
        };

        let started = Instant::now();
        let result = match time::timeout(timeout, transport.probe(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Ok(()) => Ok(started.elapsed()),
            Err(TransportError::Connection(source)) => {
                self.transport_lost(&source.to_string()).await;
                Err(LinkError::Connection {
                    device_id: self.device_id(),
                    source,
                })
            }
            Err(err) => Err(LinkError::from_transport(self.status.device_id(), err)),
        }
    }

    /// Open a transport only for the duration of one probe. The task stays
    /// Disconnected and nothing is kept; commands wait in the mailbox meanwhile.
    async fn probe_transient(&mut self, timeout: Duration) -> Result<Duration, LinkError> {
        let address = self.status.descriptor.address.clone();
        let started = Instant::now();
        let mut transport = match time::timeout(timeout, self.adapter.connect(&address)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(source)) => {
                return Err(LinkError::Connection {
                    device_id: self.device_id(),
                    source,
                })
            }
            Err(_) => {
                return Err(LinkError::Connection {
                    device_id: self.device_id(),
                    source: ConnectionError::Timeout { address, timeout },
                })
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let probed = match time::timeout(remaining, transport.probe(remaining)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(remaining)),
        };
        transport.disconnect().await;

        probed
            .map(|()| started.elapsed())
            .map_err(|e| LinkError::from_transport(self.status.device_id(), e))
    }

    fn enqueue(&mut self, entry: QueuedCommand) {
        let capacity = self.queue.capacity();
        let full = || LinkError::QueueFull {
            device_id: self.status.device_id().to_string(),
            capacity,
        };

        match self.queue.push(entry) {
            PushOutcome::Queued => {
                tracing::debug!(
                    device_id = %self.status.device_id(),
                    queued = self.queue.len(),
                    "Command queued until reconnection"
                );
            }
            PushOutcome::Evicted(oldest) => {
                tracing::warn!(device_id = %self.status.device_id(), command_id = %oldest.id, "Queue full, dropped oldest command");
                oldest.complete(Err(full()));
            }
            PushOutcome::Rejected(entry) => {
                tracing::warn!(device_id = %self.status.device_id(), "Queue full, command rejected");
                entry.complete(Err(full()));
            }
        }
        self.publish_queue_len();
    }

    fn expire_queued(&mut self) {
        let max_wait = self.config.max_queue_wait();
        let expired = self.queue.take_expired(max_wait);
        if expired.is_empty() {
            return;
        }

        tracing::warn!(
            device_id = %self.status.device_id(),
            expired = expired.len(),
            "Queued commands waited too long"
        );
        for entry in expired {
            entry.complete(Err(LinkError::Timeout {
                operation: format!("queued command for {}", self.status.device_id()),
                timeout: max_wait,
            }));
        }
        self.publish_queue_len();
    }

    /// Drop the transport and start reconnecting.
    async fn transport_lost(&mut self, reason: &str) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        let failures = self.status.record_failure();
        tracing::warn!(
            device_id = %self.status.device_id(),
            reason = %reason,
            consecutive_failures = failures,
            "Transport lost"
        );
        self.status.set_reconnect_attempts(0);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let attempt = self.status.reconnect_attempts() + 1;
        let delay = self.reconnect_policy.delay(attempt);
        self.next_reconnect = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting);
        tracing::debug!(
            device_id = %self.status.device_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
    }

    async fn reconnect(&mut self) {
        self.next_reconnect = None;
        let attempt = self.status.reconnect_attempts() + 1;
        self.status.set_reconnect_attempts(attempt);
        metrics::record_reconnect(self.status.device_id());

        match self.establish().await {
            Ok(()) => self.drain_queue().await,
            Err(_) if self.reconnect_policy.is_exhausted(attempt) => self.mark_failed(attempt),
            Err(_) => self.schedule_reconnect(),
        }
    }

    fn mark_failed(&mut self, attempts: u32) {
        self.set_state(ConnectionState::Failed);
        let queued = self.queue.take_all();
        tracing::error!(
            device_id = %self.status.device_id(),
            attempts,
            rejected = queued.len(),
            "Reconnect attempts exhausted, device marked failed"
        );
        for entry in queued {
            entry.complete(Err(LinkError::DeviceFailed {
                device_id: self.device_id(),
                attempts,
            }));
        }
        self.publish_queue_len();
    }

    async fn keep_alive(&mut self) {
        let interval = self.config.keep_alive_interval();
        let idle = self.status.idle_for();
        if idle < interval {
            // Recent command traffic already proves the link.
            self.next_keep_alive = Instant::now() + (interval - idle);
            return;
        }
        self.next_keep_alive = Instant::now() + interval;

        let timeout = self.config.keep_alive_timeout();
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = match time::timeout(timeout, transport.probe(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Ok(()) | Err(TransportError::Protocol(_)) => self.probe_failures = 0,
            Err(err) => {
                self.probe_failures += 1;
                tracing::debug!(
                    device_id = %self.status.device_id(),
                    failures = self.probe_failures,
                    error = %err,
                    "Keep-alive probe failed"
                );
                if self.probe_failures >= self.config.keep_alive_failure_threshold {
                    self.probe_failures = 0;
                    self.transport_lost("keep-alive probes failed").await;
                }
            }
        }
    }

    /// Replay queued commands in order, pausing between sends. Stops early if the
    /// transport is lost; the remaining entries wait for the next reconnection.
    async fn drain_queue(&mut self) {
        let delay = self.config.queue_drain_delay();
        let max_attempts = self.config.max_command_attempts;
        let mut sent_any = false;

        if !self.queue.is_empty() {
            tracing::info!(
                device_id = %self.status.device_id(),
                queued = self.queue.len(),
                "Draining queued commands"
            );
        }

        while self.transport.is_some() {
            self.expire_queued();
            let Some(mut entry) = self.queue.pop_front() else {
                break;
            };
            self.publish_queue_len();

            if entry.is_abandoned() {
                tracing::debug!(command_id = %entry.id, "Skipping abandoned queued command");
                continue;
            }
            if sent_any {
                time::sleep(delay).await;
            }
            sent_any = true;

            entry.attempts += 1;
            let started = Instant::now();
            let device_id = self.device_id();

            match self.transmit(&entry.command, entry.timeout).await {
                Ok(response) => {
                    self.status.record_sent();
                    self.status.reset_failures();
                    metrics::record_command(&device_id, "ok", started.elapsed());
                    entry.complete(Ok(response));
                }
                Err(TransportError::Protocol(source)) => {
                    self.status.touch();
                    metrics::record_command(&device_id, "protocol_error", started.elapsed());
                    entry.complete(Err(LinkError::Protocol { device_id, source }));
                }
                Err(TransportError::Timeout(timeout)) => {
                    metrics::record_command(&device_id, "timeout", started.elapsed());
                    entry.complete(Err(LinkError::Timeout {
                        operation: format!("command to {}", device_id),
                        timeout,
                    }));
                    self.transport_lost("queued command timed out").await;
                }
                Err(TransportError::Connection(source)) => {
                    metrics::record_command(&device_id, "connection_error", started.elapsed());
                    self.transport_lost(&source.to_string()).await;
                    if entry.attempts >= max_attempts {
                        entry.complete(Err(LinkError::Connection { device_id, source }));
                    } else {
                        self.queue.requeue(entry);
                        self.publish_queue_len();
                    }
                }
            }
        }
    }

    async fn close(&mut self, policy: DrainPolicy, reason: CloseReason) {
        if policy == DrainPolicy::Drain && self.transport.is_some() {
            self.drain_queue().await;
        }

        let err = match reason {
            CloseReason::Shutdown => LinkError::ShuttingDown,
            CloseReason::Disconnect | CloseReason::Idle | CloseReason::Replaced => LinkError::Disconnected {
                device_id: self.device_id(),
            },
        };
        let rejected = self.queue.take_all();
        if !rejected.is_empty() {
            tracing::warn!(
                device_id = %self.status.device_id(),
                rejected = rejected.len(),
                reason = ?reason,
                "Rejecting queued commands on close"
            );
        }
        for entry in rejected {
            entry.complete(Err(err.clone()));
        }
        self.publish_queue_len();

        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.next_reconnect = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(device_id = %self.status.device_id(), reason = ?reason, "Connection closed");
    }
}
