//! Capability discovery endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use meshlink_core::{CapabilitiesResponse, DiscoveryRequest};
use tracing::warn;

use super::AppState;

pub async fn capabilities_handler(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<CapabilitiesResponse>, (StatusCode, String)> {
    let _guard = state.shutdown.in_flight_guard();

    let request: DiscoveryRequest = serde_json::from_str(&body).map_err(|err| {
        warn!(error = %err, "malformed discovery request");
        (StatusCode::BAD_REQUEST, format!("Malformed request: {err}"))
    })?;

    state
        .dispatch
        .discover(&request)
        .map(Json)
        .map_err(|err| (StatusCode::UNAUTHORIZED, err.to_string()))
}
