//! Protocol adapter subsystem.
//!
//! # Data Flow
//! ```text
//! ConnectionManager
//!     → registry.rs (ProtocolKind → adapter)
//!     → ProtocolAdapter::connect(address) → Box<dyn Transport>
//!     → Transport::send / probe / disconnect
//! ```
//!
//! # Design Decisions
//! - Adapters own framing and payload interpretation; the manager never looks inside
//! - `ProtocolKind` is an open string so new hardware families need no manager change
//! - A transport is owned by exactly one device task, so it takes `&mut self`

pub mod line;
pub mod registry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, TransportError};

pub use line::LineTcpAdapter;
pub use registry::AdapterRegistry;

/// Name of a device protocol family (e.g. `matrix-line`, `ir-blaster`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolKind(String);

impl ProtocolKind {
    pub const MATRIX_LINE: &'static str = "matrix-line";
    pub const IR_BLASTER: &'static str = "ir-blaster";
    pub const DSP_JSONRPC: &'static str = "dsp-jsonrpc";
    pub const ADB_SHELL: &'static str = "adb-shell";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An opaque command payload bound for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    payload: String,
}

impl Command {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}

/// A device reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub payload: String,
    /// Time between writing the command and reading the reply.
    pub latency: Duration,
}

impl Response {
    pub fn new(payload: impl Into<String>, latency: Duration) -> Self {
        Self {
            payload: payload.into(),
            latency,
        }
    }
}

/// Per device-type connection factory.
///
/// Implementations are registered once in an [`AdapterRegistry`] and shared by every
/// connection of that protocol kind.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// The protocol family this adapter serves.
    fn kind(&self) -> ProtocolKind;

    /// Open a transport to `address`.
    ///
    /// The manager bounds this call with its connect timeout; adapters may apply a
    /// tighter one of their own.
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// A live, exclusively owned link to one device.
#[async_trait]
pub trait Transport: Send {
    /// Send one command and wait for its reply.
    async fn send(&mut self, command: &Command, timeout: Duration) -> Result<Response, TransportError>;

    /// Lightweight no-op used for keep-alive and health checks.
    async fn probe(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Close the link. Errors are swallowed; the transport is dropped afterwards.
    async fn disconnect(&mut self);
}
