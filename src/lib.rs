//! Device connection and resilience layer.
//!
//! Keeps long-lived connections to networked devices (matrix switchers, IR blasters,
//! DSPs, set-top boxes) and shields callers from their failures with per-device command
//! queues, reconnect backoff, circuit breakers, rate limiting and health monitoring.

pub mod admin;
pub mod config;
pub mod connection;
pub mod devices;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod security;
pub mod service;
pub mod upstream;

pub use config::LinkConfig;
pub use connection::{CommandOptions, ConnectionManager, ConnectionState};
pub use devices::{DeviceDescriptor, DeviceRegistry};
pub use error::{ErrorKind, LinkError};
pub use lifecycle::Shutdown;
pub use protocol::{AdapterRegistry, Command, ProtocolAdapter, ProtocolKind, Response};
pub use service::{DeviceLink, ServiceStatus};
