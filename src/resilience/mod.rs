//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a device or upstream:
//!     → registry.rs (one named breaker per dependency)
//!     → circuit_breaker.rs (admit, time the call, roll the outcome into the window)
//!     → timeouts.rs (every external call has a deadline)
//! Device transport lost:
//!     → retries.rs (ReconnectPolicy: bounded attempts)
//!     → backoff.rs (exponential delay with jitter)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Breakers are per dependency and never share state
//! - Only errors that say something about the dependency's health trip a breaker
//! - Jittered backoff prevents reconnect storms after a network blip

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerStats, BreakerStatus, CircuitBreaker, CircuitError, CircuitState, TripsBreaker};
pub use registry::CircuitBreakerRegistry;
pub use retries::ReconnectPolicy;
pub use timeouts::with_timeout;
