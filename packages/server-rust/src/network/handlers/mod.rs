//! HTTP and WebSocket request handlers.

mod capabilities;
mod events;
mod health;
mod invoke;

use std::sync::Arc;

pub use capabilities::capabilities_handler;
pub use events::events_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use invoke::invoke_handler;

use crate::dispatch::DispatchServer;
use crate::events::EventBroker;
use crate::network::shutdown::ShutdownController;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatch: Arc<DispatchServer>,
    pub broker: Arc<EventBroker>,
    pub shutdown: Arc<ShutdownController>,
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::auth::AuthProvider;

    let auth = Arc::new(AuthProvider::new());
    auth.register_client("client1", "sk_client1_12345abcde", ["read", "write", "subscribe"]);
    auth.register_client("client2", "sk_client2_67890fghij", ["read"]);
    let dispatch = Arc::new(DispatchServer::new(auth));
    let broker = dispatch.broker();
    AppState {
        dispatch,
        broker,
        shutdown: Arc::new(ShutdownController::new()),
    }
}
