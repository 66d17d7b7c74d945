//! Read-only admin API.
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::service::DeviceLink;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub link: Arc<DeviceLink>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(link: Arc<DeviceLink>, api_key: &str) -> Self {
        Self {
            link,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/connections", get(get_connections))
        .route("/admin/connections/{device_id}", get(get_connection))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/health", get(get_health))
        .route("/admin/health/run", post(run_health_check))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
