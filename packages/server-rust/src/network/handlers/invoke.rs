//! Method invocation endpoint.
//!
//! Takes the raw body so envelope decode failures can still be answered
//! with a protocol-level `ERROR` response instead of a bare 4xx: a caller
//! that managed to reach the endpoint always gets a `MethodResponse` back.

use axum::extract::State;
use axum::Json;
use meshlink_core::{DispatchError, MethodRequest, MethodResponse};
use tracing::warn;
use uuid::Uuid;

use super::AppState;

pub async fn invoke_handler(State(state): State<AppState>, body: String) -> Json<MethodResponse> {
    let _guard = state.shutdown.in_flight_guard();

    match serde_json::from_str::<MethodRequest>(&body) {
        Ok(request) => Json(state.dispatch.invoke(request).await),
        Err(err) => {
            warn!(error = %err, "malformed invocation envelope");
            let err = DispatchError::Malformed(err.to_string());
            // The request id is unknown; nil correlates with nothing.
            Json(MethodResponse::failure(
                Uuid::nil(),
                err.status(),
                err.to_string(),
            ))
        }
    }
}
