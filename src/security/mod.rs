//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound device command:
//!     → rate_limit.rs (sliding window per identifier and tier)
//!     → circuit breaker → connection manager
//! ```
//!
//! # Design Decisions
//! - Fail closed: a denied request never reaches a device
//! - Denials are side-effect free and carry a retry-after hint

pub mod rate_limit;

pub use rate_limit::{RateLimitDecision, RateLimiter};
