//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer (monitor.rs)
//!     → read DeviceRegistry
//!     → probe.rs (DeviceProbe, bounded parallelism, per-probe timeout)
//!     → join every result, failures included
//!     → state.rs (HealthSnapshot) swapped in atomically
//! ```
//!
//! # Design Decisions
//! - One failing device never aborts a pass
//! - Readers get a whole snapshot or the previous one, never a mix
//! - A pass that started earlier never replaces a newer committed pass

pub mod monitor;
pub mod probe;
pub mod state;

pub use monitor::HealthMonitor;
pub use probe::DeviceProbe;
pub use state::{HealthRecord, HealthSnapshot, HealthStats};
