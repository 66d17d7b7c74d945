//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

use device_link::error::{ConnectionError, ProtocolError, TransportError};
use device_link::protocol::{Command, ProtocolAdapter, ProtocolKind, Response, Transport};

pub const MOCK_PROTOCOL: &str = "mock-line";

/// Scriptable device behaviour shared by every transport the adapter hands out.
///
/// Payload conventions: `BAD` yields a malformed response, `NO` a rejection and `SLOW`
/// never answers.
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicUsize,
    /// Refuse every connect while set.
    pub down: AtomicBool,
    /// Refuse this many upcoming connects.
    pub fail_connects: AtomicUsize,
    pub connect_delay: Mutex<Duration>,
    /// Sends and probes on live transports fail with a reset while set.
    pub broken: AtomicBool,
    pub probes: AtomicUsize,
    /// Added to every liveness check on a live transport.
    pub check_delay: Mutex<Duration>,
    pub sent: Mutex<Vec<(String, Instant)>>,
    /// Transports currently open, and the most ever open at once.
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl MockState {
    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

pub struct MockAdapter {
    kind: ProtocolKind,
    pub state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::with_kind(MOCK_PROTOCOL)
    }

    pub fn with_kind(kind: &str) -> Self {
        Self {
            kind: ProtocolKind::new(kind),
            state: Arc::new(MockState::default()),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind.clone()
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, ConnectionError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = self
            .state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.state.down.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused {
                address: address.to_string(),
            });
        }

        self.state.broken.store(false, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, command: &Command, _timeout: Duration) -> Result<Response, TransportError> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(ConnectionError::Reset("mock link dropped".into()).into());
        }

        let payload = command.payload().to_string();
        self.state.sent.lock().unwrap().push((payload.clone(), Instant::now()));

        match payload.as_str() {
            "BAD" => Err(ProtocolError::Malformed("garbled frame".into()).into()),
            "NO" => Err(ProtocolError::Rejected("ERR 12".into()).into()),
            "SLOW" => std::future::pending().await,
            _ => Ok(Response::new(format!("OK {}", payload), Duration::from_millis(1))),
        }
    }

    async fn probe(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.check_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(ConnectionError::Reset("mock link dropped".into()).into());
        }
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Start a programmable HTTP backend on an ephemeral port; returns its address.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = socket.read(&mut buf).await;

                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}
