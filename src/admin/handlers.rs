use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::admin::AdminState;
use crate::connection::{ConnectionStatusSummary, DeviceStatusSnapshot};
use crate::health::HealthSnapshot;
use crate::resilience::BreakerStatus;
use crate::service::ServiceStatus;

pub async fn get_status(State(state): State<AdminState>) -> Json<ServiceStatus> {
    Json(state.link.status())
}

pub async fn get_connections(State(state): State<AdminState>) -> Json<ConnectionStatusSummary> {
    Json(state.link.get_connection_status(None))
}

pub async fn get_connection(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStatusSnapshot>, Response> {
    if state.link.devices().get(&device_id).is_none() {
        return Err(not_found(format!("unknown device: {}", device_id)));
    }

    state
        .link
        .get_connection_status(Some(&device_id))
        .devices
        .remove(&device_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("no connection for device: {}", device_id)))
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<BTreeMap<String, BreakerStatus>> {
    Json(state.link.get_circuit_breaker_status())
}

pub async fn get_health(State(state): State<AdminState>) -> Json<HealthSnapshot> {
    Json(state.link.health_snapshot().as_ref().clone())
}

pub async fn run_health_check(State(state): State<AdminState>) -> Json<HealthSnapshot> {
    Json(state.link.run_health_check().await.as_ref().clone())
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
