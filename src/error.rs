//! Error taxonomy for the connection and resilience layer.
//!
//! # Design Decisions
//! - Every failure reaching a caller is a typed `LinkError`; logging is a side effect
//! - Transport failures (`ConnectionError`) are handled by the device task first and
//!   only surface when reconnection cannot help
//! - Protocol failures (`ProtocolError`) are never retried
//! - Admission rejections (rate limit, open circuit, full queue) carry no side effects

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::connection::state::ConnectionState;
use crate::protocol::ProtocolKind;

/// Transport-level failures: the device could not be reached or the link dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection refused by {address}")]
    Refused { address: String },

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("connecting to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("transport error: {0}")]
    Io(String),

    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },
}

impl ConnectionError {
    /// Classify an I/O error raised while talking to `address`.
    pub fn from_io(address: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionError::Refused {
                address: address.to_string(),
            },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ConnectionError::Reset(err.to_string()),
            _ => ConnectionError::Io(err.to_string()),
        }
    }
}

/// Application-level failures: the device answered, but not usefully.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The response could not be framed or decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The device understood the command and refused it.
    #[error("device rejected command: {0}")]
    Rejected(String),
}

/// Errors a `Transport` may return from `send` or `probe`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced to callers of the layer.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("device {device_id}: {source}")]
    Connection {
        device_id: String,
        #[source]
        source: ConnectionError,
    },

    #[error("device {device_id}: {source}")]
    Protocol {
        device_id: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("command queue for {device_id} is full ({capacity} pending)")]
    QueueFull { device_id: String, capacity: usize },

    #[error("circuit {name} is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("rate limit exceeded for {identifier} (tier {tier}), retry after {retry_after:?}")]
    RateLimitExceeded {
        identifier: String,
        tier: String,
        retry_after: Duration,
    },

    #[error("device {device_id} marked failed after {attempts} reconnect attempts")]
    DeviceFailed { device_id: String, attempts: u32 },

    #[error("connection to {device_id} closed before the command was sent")]
    Disconnected { device_id: String },

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("no protocol adapter registered for {0}")]
    UnknownProtocol(ProtocolKind),

    #[error("upstream {name}: {message}")]
    Upstream {
        name: String,
        status: Option<u16>,
        message: String,
    },

    #[error("device layer is shutting down")]
    ShuttingDown,
}

/// Coarse error classification, stable for API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    QueueFull,
    CircuitOpen,
    RateLimited,
    DeviceFailed,
    Disconnected,
    NotFound,
    Upstream,
    ShuttingDown,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Connection { .. } => ErrorKind::Connection,
            LinkError::Protocol { .. } => ErrorKind::Protocol,
            LinkError::Timeout { .. } => ErrorKind::Timeout,
            LinkError::QueueFull { .. } => ErrorKind::QueueFull,
            LinkError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            LinkError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            LinkError::DeviceFailed { .. } => ErrorKind::DeviceFailed,
            LinkError::Disconnected { .. } => ErrorKind::Disconnected,
            LinkError::UnknownDevice(_) | LinkError::UnknownProtocol(_) => ErrorKind::NotFound,
            LinkError::Upstream { .. } => ErrorKind::Upstream,
            LinkError::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Hint for callers that were rejected by admission control.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LinkError::CircuitOpen { retry_after, .. }
            | LinkError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn from_transport(device_id: &str, err: TransportError) -> Self {
        match err {
            TransportError::Connection(source) => LinkError::Connection {
                device_id: device_id.to_string(),
                source,
            },
            TransportError::Protocol(source) => LinkError::Protocol {
                device_id: device_id.to_string(),
                source,
            },
            TransportError::Timeout(timeout) => LinkError::Timeout {
                operation: format!("command to {}", device_id),
                timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            ConnectionError::from_io("10.0.0.5:5000", &refused),
            ConnectionError::Refused {
                address: "10.0.0.5:5000".into()
            }
        );

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            ConnectionError::from_io("10.0.0.5:5000", &eof),
            ConnectionError::Reset(_)
        ));
    }

    #[test]
    fn transport_errors_keep_their_kind() {
        let err = LinkError::from_transport(
            "matrix-1",
            TransportError::Protocol(ProtocolError::Malformed("empty".into())),
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("matrix-1"));

        let err = LinkError::from_transport("matrix-1", TransportError::Timeout(Duration::from_secs(2)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn admission_errors_expose_retry_after() {
        let err = LinkError::RateLimitExceeded {
            identifier: "10.1.1.1".into(),
            tier: "hardware".into(),
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(LinkError::ShuttingDown.retry_after(), None);
    }
}
