//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → LinkConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → device list swapped into the DeviceRegistry
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the device list is hot-reloaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, CircuitBreakerConfig, ConnectionConfig, DrainPolicy, HealthCheckConfig, LinkConfig,
    LogFormat, ObservabilityConfig, QueueFullPolicy, RateLimitConfig, RateLimitTier, UpstreamConfig,
};
pub use watcher::ConfigWatcher;
