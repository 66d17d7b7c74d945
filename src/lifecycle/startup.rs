//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the `DeviceLink` from a validated configuration
//! - Spawn background tasks in dependency order
//! - Bind the admin listener last, so traffic only arrives once everything is ready
//!
//! # Design Decisions
//! - Fail fast: any startup error is returned before a task is spawned
//! - Every task subscribes to the same `Shutdown` broadcast

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{admin_router, AdminState};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::lifecycle::shutdown::Shutdown;
use crate::protocol::AdapterRegistry;
use crate::service::DeviceLink;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// A started device link and the tasks it owns.
pub struct Runtime {
    pub link: Arc<DeviceLink>,
    pub shutdown: Shutdown,
    pub admin_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Stop background tasks, then drain or reject every device queue.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down device link");
        self.shutdown.trigger();
        self.link.shutdown().await;

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Shutdown complete");
    }
}

/// Build the service and spawn its background tasks.
pub async fn start(config: LinkConfig, adapters: AdapterRegistry) -> Result<Runtime, StartupError> {
    let admin = config.admin.clone();
    let sweeper_enabled = config.rate_limit.enabled;

    let link = Arc::new(DeviceLink::new(config, adapters)?);
    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(link.health().clone().run(shutdown.subscribe())));
    tasks.push(tokio::spawn(link.connections().clone().run_cleanup(shutdown.subscribe())));
    if sweeper_enabled {
        tasks.push(tokio::spawn(link.rate_limiter().clone().run_sweeper(shutdown.subscribe())));
    }

    let mut admin_addr = None;
    if admin.enabled {
        let listener = TcpListener::bind(&admin.bind_address)
            .await
            .map_err(|source| StartupError::Bind {
                address: admin.bind_address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
            address: admin.bind_address.clone(),
            source,
        })?;
        admin_addr = Some(local_addr);

        let router = admin_router(AdminState::new(link.clone(), &admin.api_key));
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            tracing::info!(address = %local_addr, "Admin API listening");
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API server failed");
            }
            tracing::info!("Admin API stopped");
        }));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tasks = tasks.len(),
        admin = ?admin_addr,
        "Device link started"
    );

    Ok(Runtime {
        link,
        shutdown,
        admin_addr,
        tasks,
    })
}
