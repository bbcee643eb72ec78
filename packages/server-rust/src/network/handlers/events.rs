//! Event stream endpoint.
//!
//! The client upgrades to a WebSocket and sends one JSON
//! [`SubscribeRequest`] as its first text frame. The server authenticates
//! it, requires the `subscribe` permission, registers the subscription
//! with the broker, and then pushes matching [`EventNotification`]s as
//! text frames until the client disconnects, falls behind, or the server
//! drains.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use meshlink_core::SubscribeRequest;
use tracing::{debug, info, warn};

use super::AppState;

pub async fn events_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| event_stream(socket, state))
}

async fn event_stream(mut socket: WebSocket, state: AppState) {
    let request = match read_subscribe_request(&mut socket).await {
        Ok(request) => request,
        Err(reason) => {
            warn!(reason, "rejecting event stream");
            close_with(&mut socket, reason).await;
            return;
        }
    };

    let auth = state.dispatch.auth();
    if auth
        .authenticate(&request.client_id, &request.api_key)
        .is_none()
    {
        close_with(&mut socket, "Authentication failed").await;
        return;
    }
    if !auth.has_permission(&request.client_id, "subscribe") {
        close_with(&mut socket, "Permission denied: subscribe required").await;
        return;
    }

    let (subscription_id, mut events) = state.broker.subscribe(
        &request.client_id,
        &request.pattern,
        request.subscription_id,
    );
    let mut shutdown = state.shutdown.shutdown_receiver();
    info!(
        client_id = %request.client_id,
        pattern = %request.pattern,
        subscription_id = %subscription_id,
        "event stream open"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "unserializable event, skipping");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                // The broker evicted this subscription (failed delivery).
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pings are answered by axum; other frames are ignored.
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.broker.unsubscribe(subscription_id);
    debug!(subscription_id = %subscription_id, "event stream closed");
}

/// Reads and decodes the first text frame as a subscription request.
async fn read_subscribe_request(socket: &mut WebSocket) -> Result<SubscribeRequest, &'static str> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|_| "Malformed subscription request");
            }
            // Skip control frames that may precede the first text frame.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            _ => return Err("Expected subscription request"),
        }
    }
}

async fn close_with(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}
