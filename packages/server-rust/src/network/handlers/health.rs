//! Health, liveness, and readiness endpoint handlers.
//!
//! `/health` speaks the protocol's health-check envelope so clients can
//! gate connection establishment on it; the liveness and readiness probes
//! exist for orchestrators.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use meshlink_core::{HealthCheckResponse, HealthStatus};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::network::shutdown::HealthState;

#[derive(Debug, Deserialize)]
pub struct HealthCheckQuery {
    pub client_id: Option<String>,
}

/// Protocol health check. Reports `SERVING` only while the server is in
/// the `Ready` state; always answers 200 so callers can read the body.
pub async fn health_handler(
    State(state): State<AppState>,
    Query(query): Query<HealthCheckQuery>,
) -> Json<HealthCheckResponse> {
    if let Some(client_id) = &query.client_id {
        debug!(client_id, "health check");
    }
    let status = if state.shutdown.health_state() == HealthState::Ready {
        HealthStatus::Serving
    } else {
        HealthStatus::NotServing
    };
    Json(HealthCheckResponse { status })
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// Only checks whether the process is responsive; a failed liveness probe
/// triggers a restart, so it must not depend on health state.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// 503 during startup, draining, and after stop removes the instance from
/// the load balancer's endpoint list.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
