//! External HTTP APIs reached through circuit breakers.
//!
//! # Data Flow
//! ```text
//! get_json(path)
//!     → breaker "upstream:<name>" (fast-fail while open)
//!     → reqwest GET base_url + path
//!     → success: refresh last-known-good cache
//!     → failure or rejection: serve cached body marked stale, if any
//! ```

pub mod http;

pub use http::{HttpUpstream, UpstreamResponse};
