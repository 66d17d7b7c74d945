//! device-link daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!     caller ──▶ DeviceLink::execute_device_command
//!                   │
//!                   ├─▶ security::RateLimiter      (caller identity + tier)
//!                   ├─▶ resilience::CircuitBreaker  ("device:<id>")
//!                   └─▶ connection::ConnectionManager
//!                           └─▶ one task per device: queue, keep-alive, reconnect
//!                                   └─▶ protocol::ProtocolAdapter transport ──▶ device
//!
//!     health::HealthMonitor      periodic probes, atomic snapshots
//!     upstream::HttpUpstream     breaker-guarded HTTP with stale fallback
//!     admin                      read-only JSON status API (linkctl)
//!     config / lifecycle / observability
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use device_link::config::{load_config, ConfigWatcher, LinkConfig};
use device_link::lifecycle::{self, signals::wait_for_signal};
use device_link::observability::{logging::init_logging, metrics::init_metrics};
use device_link::protocol::{AdapterRegistry, LineTcpAdapter};

#[derive(Parser)]
#[command(name = "device-link")]
#[command(about = "Resilient connections to networked AV and control devices", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => LinkConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "device-link starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let adapters = AdapterRegistry::new()
        .with(Arc::new(LineTcpAdapter::matrix()))
        .with(Arc::new(LineTcpAdapter::ir_blaster()))
        .with(Arc::new(LineTcpAdapter::dsp_jsonrpc()));

    let runtime = lifecycle::start(config, adapters).await?;

    // Hot reload of the device list only; other sections need a restart.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let link = runtime.link.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    link.reload_devices(new_config.devices).await;
                }
            });
            match watcher.run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::error!(error = %e, "Config watcher failed to start, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    wait_for_signal().await;
    runtime.shutdown().await;
    Ok(())
}
