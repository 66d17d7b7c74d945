//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → DeviceLink → background tasks → admin listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast to tasks → drain or reject queues → close transports
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: core first, listeners last
//! - Shutdown has a deadline: device tasks still running after it are aborted

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{start, Runtime, StartupError};
