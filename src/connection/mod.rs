//! Connection management subsystem.
//!
//! # Data Flow
//! ```text
//! execute_command(device_id, command)
//!     → manager.rs (registry lookup, DashMap of device tasks)
//!     → device.rs (mailbox → one task per device)
//!         → Connected: Transport::send
//!         → unreachable: queue.rs (bounded FIFO) → reconnect with backoff → drain
//!     → reply over a oneshot channel
//! ```
//!
//! # Design Decisions
//! - One task owns each device's transport and queue; no locks around device state
//! - Concurrent connect requests are answered by the attempt already in flight
//! - Status is published through atomics (state.rs) so readers never wait on a device
//! - Protocol errors are surfaced immediately; only transport loss triggers reconnection

pub mod device;
pub mod manager;
pub mod queue;
pub mod state;

pub use device::ConnectionHandle;
pub use manager::{Caller, CommandOptions, ConnectionManager, ConnectionStats, ConnectionStatusSummary};
pub use queue::{CommandQueue, PushOutcome, QueuedCommand};
pub use state::{ConnectionState, DeviceStatus, DeviceStatusSnapshot};
