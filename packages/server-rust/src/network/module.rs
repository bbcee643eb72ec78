//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. The split lets callers register methods and learn the
//! bound port (port 0 gives an OS-assigned one) before traffic arrives.

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    capabilities_handler, events_handler, health_handler, invoke_handler, liveness_handler,
    readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::dispatch::DispatchServer;

/// Manages the full HTTP/WebSocket server lifecycle.
///
/// 1. `new()` -- takes the shared dispatcher, allocates the shutdown
///    controller
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    dispatch: Arc<DispatchServer>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, dispatch: Arc<DispatchServer>) -> Self {
        Self {
            config,
            listener: None,
            dispatch,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    fn app_state(&self) -> AppState {
        AppState {
            dispatch: Arc::clone(&self.dispatch),
            broker: self.dispatch.broker(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- protocol health check
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `POST /invoke` -- signed method invocation
    /// - `POST /capabilities` -- capability discovery
    /// - `GET /events` -- WebSocket event stream
    #[must_use]
    pub fn build_router(&self) -> Router {
        let layers = build_http_layers(&self.config);

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/invoke", post(invoke_handler))
            .route("/capabilities", post(capabilities_handler))
            .route("/events", get(events_handler))
            .layer(layers)
            .with_state(self.app_state())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future completes, then drains.
    ///
    /// The shutdown future fires the controller's watch channel before the
    /// graceful shutdown begins, so open event streams close themselves
    /// instead of pinning the server open.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        // Build the router before moving the listener out of self.
        let router = self.build_router();
        let shutdown_ctrl = Arc::clone(&self.shutdown);
        let drain_timeout = self.config.drain_timeout;
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        info!("Serving HTTP/WS connections on {}", listener.local_addr()?);

        // Transition to Ready so health checks pass.
        shutdown_ctrl.set_ready();

        let trigger = Arc::clone(&shutdown_ctrl);
        let graceful = async move {
            shutdown.await;
            trigger.trigger_shutdown();
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await?;

        let drained = shutdown_ctrl.wait_for_drain(drain_timeout).await;
        if drained {
            info!("All in-flight requests drained");
        } else {
            warn!("Drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}
