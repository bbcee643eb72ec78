//! Resilient single-server connector.
//!
//! Wraps the HTTP/WebSocket transport with connection state tracking,
//! capped exponential-backoff reconnection, a per-connector circuit
//! breaker, and a single supervised event-listener task. All fallible
//! operations degrade to errors or `false`; nothing here panics the
//! application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshlink_core::{
    decode_payload, encode_payload, pattern_matches, signature, CapabilitiesResponse, Capability,
    DiscoveryRequest, EventNotification, HealthCheckResponse, HealthStatus, MethodRequest,
    MethodResponse, SubscribeRequest,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::ConnectorConfig;
use crate::error::ClientError;

/// Callback invoked for every event matching a subscribed pattern.
///
/// Runs on the listener task; errors are logged and never propagated.
pub type EventHandler = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Connection to one server, identified by its base URL.
///
/// Shared behind `Arc` so the event-listener task can hold a reference.
pub struct ClientConnector {
    base_url: String,
    client_id: String,
    api_key: String,
    config: ConnectorConfig,
    http: reqwest::Client,
    connected: AtomicBool,
    breaker: CircuitBreaker,
    capabilities: RwLock<HashMap<String, Capability>>,
    handlers: RwLock<Vec<(String, EventHandler)>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    // Serializes concurrent reconnect() callers so only one walks the
    // backoff schedule at a time.
    reconnect_gate: tokio::sync::Mutex<()>,
    // Self-reference so the listener task can be spawned from &self.
    weak: Weak<ClientConnector>,
}

impl ClientConnector {
    /// Creates a connector with default configuration. `base_url` is the
    /// server's HTTP root, e.g. `http://127.0.0.1:50051`.
    #[must_use]
    pub fn new(base_url: &str, client_id: &str, api_key: &str) -> Arc<Self> {
        Self::with_config(base_url, client_id, api_key, ConnectorConfig::default())
    }

    #[must_use]
    pub fn with_config(
        base_url: &str,
        client_id: &str,
        api_key: &str,
        config: ConnectorConfig,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Arc::new_cyclic(|weak| Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            api_key: api_key.to_string(),
            config,
            http: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            breaker,
            capabilities: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            listener: Mutex::new(None),
            reconnect_gate: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Health-checks the server and, on success, marks the connector
    /// connected and caches the server's capabilities. Returns whether the
    /// connection attempt succeeded; failures are logged, not raised.
    pub async fn connect(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("client_id", self.client_id.as_str())])
            .timeout(self.config.request_timeout)
            .send()
            .await;

        let health: HealthCheckResponse = match response {
            Ok(response) => match response.json().await {
                Ok(health) => health,
                Err(err) => {
                    warn!(error = %err, "health check returned unreadable body");
                    self.connected.store(false, Ordering::SeqCst);
                    return false;
                }
            },
            Err(err) => {
                warn!(error = %err, "health check failed");
                self.connected.store(false, Ordering::SeqCst);
                return false;
            }
        };

        if health.status != HealthStatus::Serving {
            warn!(base_url = %self.base_url, "server is not serving");
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(base_url = %self.base_url, client_id = %self.client_id, "connected");

        // Best-effort: a failed discovery leaves the connection usable.
        if let Err(err) = self.discover_capabilities().await {
            warn!(error = %err, "capability discovery failed");
        }
        true
    }

    /// Attempts to re-establish the connection with capped exponential
    /// backoff plus jitter. Returns whether a connection was established
    /// within the configured attempt budget.
    pub async fn reconnect(&self) -> bool {
        let _gate = self.reconnect_gate.lock().await;
        if self.is_connected() {
            return true;
        }

        for attempt in 0..self.config.reconnect_attempts {
            info!(
                attempt = attempt + 1,
                max = self.config.reconnect_attempts,
                base_url = %self.base_url,
                "reconnection attempt"
            );
            if self.connect().await {
                return true;
            }
            let delay = self.backoff_delay(attempt);
            debug!(?delay, "backing off before next attempt");
            tokio::time::sleep(delay).await;
        }

        error!(
            attempts = self.config.reconnect_attempts,
            base_url = %self.base_url,
            "failed to reconnect"
        );
        false
    }

    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped,
    /// plus up to `backoff_jitter` of random spread.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exponential.min(self.config.backoff_cap);
        let jitter = capped.mul_f64(self.config.backoff_jitter * rand::random::<f64>());
        capped + jitter
    }

    /// Fetches the capabilities visible to this client and refreshes the
    /// local cache.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request fails, or an `Rpc` error if
    /// the server rejects the credentials.
    pub async fn discover_capabilities(&self) -> Result<HashMap<String, Capability>, ClientError> {
        let request = DiscoveryRequest {
            client_id: self.client_id.clone(),
            api_key: self.api_key.clone(),
        };
        let response = self
            .http
            .post(format!("{}/capabilities", self.base_url))
            .timeout(self.config.request_timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Rpc {
                status: meshlink_core::ResponseStatus::Unauthorized,
                message,
            });
        }

        let discovered: CapabilitiesResponse = response.json().await?;
        let map: HashMap<String, Capability> = discovered
            .capabilities
            .into_iter()
            .map(|cap| (cap.id.clone(), cap))
            .collect();
        info!(count = map.len(), "discovered capabilities");
        *self.capabilities.write() = map.clone();
        Ok(map)
    }

    /// Returns the cached capability table from the last discovery.
    #[must_use]
    pub fn capabilities(&self) -> HashMap<String, Capability> {
        self.capabilities.read().clone()
    }

    /// Invokes a method under this connector's own client identity.
    ///
    /// # Errors
    ///
    /// See [`ClientConnector::invoke_method_as`].
    pub async fn invoke_method(
        &self,
        method_id: &str,
        parameters: &Value,
    ) -> Result<Value, ClientError> {
        let client_id = self.client_id.clone();
        self.invoke_method_as(&client_id, method_id, parameters).await
    }

    /// Invokes a method, signing as `client_id`. The request is gated by
    /// the circuit breaker and retried at most once after a transparent
    /// reconnect on transport failure. RPC-level failures never retry.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] if disconnected and reconnection
    ///   fails
    /// - [`ClientError::CircuitOpen`] if the breaker rejects the call
    /// - [`ClientError::Transport`] on unrecovered transport failure
    /// - [`ClientError::Rpc`] when the server reports a non-success status
    pub async fn invoke_method_as(
        &self,
        client_id: &str,
        method_id: &str,
        parameters: &Value,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() && !self.reconnect().await {
            return Err(ClientError::NotConnected);
        }

        self.breaker.try_acquire()?;
        let request = self.build_request(client_id, method_id, parameters)?;

        match self.send_with_retry(&request).await {
            Ok(result) => {
                self.breaker.record_success();
                Ok(result)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    fn build_request(
        &self,
        client_id: &str,
        method_id: &str,
        parameters: &Value,
    ) -> Result<MethodRequest, ClientError> {
        let timestamp = signature::unix_timestamp();
        Ok(MethodRequest {
            method_id: method_id.to_string(),
            parameters: encode_payload(parameters)?,
            request_id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            api_key: self.api_key.clone(),
            timestamp,
            signature: signature::sign(&self.api_key, method_id, client_id, timestamp),
        })
    }

    /// Sends the request; on a transport failure, reconnects and retries
    /// exactly once. RPC failures (the server answered) pass through.
    async fn send_with_retry(&self, request: &MethodRequest) -> Result<Value, ClientError> {
        match self.post_invoke(request).await {
            Err(ClientError::Transport(first)) => {
                warn!(
                    method_id = %request.method_id,
                    error = %first,
                    "transport failure, attempting reconnect and single retry"
                );
                self.connected.store(false, Ordering::SeqCst);
                if self.reconnect().await {
                    self.post_invoke(request).await
                } else {
                    Err(ClientError::Transport(first))
                }
            }
            other => other,
        }
    }

    async fn post_invoke(&self, request: &MethodRequest) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(format!("{}/invoke", self.base_url))
            .timeout(self.config.request_timeout)
            .json(request)
            .send()
            .await?;
        let response: MethodResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        if response.is_success() {
            Ok(decode_payload(&response.result)?)
        } else {
            Err(ClientError::Rpc {
                status: response.status,
                message: response.error_message,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Event subscription
    // -----------------------------------------------------------------------

    /// Registers a handler for events matching `pattern` and ensures the
    /// single background listener is running. Safe to call repeatedly; the
    /// listener subscribes once with the `"*"` pattern and filters locally,
    /// so later registrations need no server round-trip.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if disconnected and
    /// reconnection fails.
    pub async fn subscribe_to_events(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<(), ClientError> {
        if !self.is_connected() && !self.reconnect().await {
            return Err(ClientError::NotConnected);
        }

        self.handlers.write().push((pattern.to_string(), handler));
        self.ensure_listener();
        Ok(())
    }

    /// Starts the listener task if none is running. Idempotent.
    fn ensure_listener(&self) {
        let mut slot = self.listener.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let Some(connector) = self.weak.upgrade() else {
            return;
        };
        *slot = Some(tokio::spawn(async move {
            connector.event_listener_loop().await;
            debug!("event listener terminated");
        }));
    }

    async fn event_listener_loop(&self) {
        // A stable id lets a reconnecting listener replace its previous
        // subscription instead of leaking one per reconnect.
        let subscription_id = Uuid::new_v4();
        let ws_url = format!("{}/events", self.base_url.replacen("http", "ws", 1));

        while self.is_connected() {
            match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                Ok((mut stream, _)) => {
                    let subscribe = SubscribeRequest {
                        client_id: self.client_id.clone(),
                        api_key: self.api_key.clone(),
                        pattern: "*".to_string(),
                        subscription_id: Some(subscription_id),
                    };
                    let Ok(frame) = serde_json::to_string(&subscribe) else {
                        error!("subscription request not serializable");
                        return;
                    };
                    if stream.send(WsMessage::text(frame)).await.is_ok() {
                        info!(subscription_id = %subscription_id, "event stream open");
                        while let Some(message) = stream.next().await {
                            match message {
                                Ok(WsMessage::Text(text)) => self.dispatch_event(text.as_str()),
                                Ok(WsMessage::Close(_)) => break,
                                Ok(_) => {}
                                Err(err) => {
                                    warn!(error = %err, "event stream error");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "event stream connect failed");
                }
            }

            // Stream ended; re-establish the connection before retrying.
            self.connected.store(false, Ordering::SeqCst);
            if !self.reconnect().await {
                return;
            }
        }
    }

    /// Decodes an event frame and runs every matching handler. Handler
    /// errors are logged and never tear down the listener.
    fn dispatch_event(&self, raw: &str) {
        let event: EventNotification = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "undecodable event frame");
                return;
            }
        };
        let data: Value = match decode_payload(&event.data) {
            Ok(data) => data,
            Err(err) => {
                warn!(event_type = %event.event_type, error = %err, "undecodable event payload");
                return;
            }
        };

        for (pattern, handler) in self.handlers.read().iter() {
            if pattern_matches(&event.event_type, pattern) {
                if let Err(err) = handler(&event.event_type, &data) {
                    error!(
                        event_type = %event.event_type,
                        error = %err,
                        "event handler failed"
                    );
                }
            }
        }
    }

    /// Stops the event listener and marks the connector disconnected.
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(base_url = %self.base_url, "connection closed");
    }
}

impl Drop for ClientConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> Arc<ClientConnector> {
        ClientConnector::new("http://127.0.0.1:1/", "client1", "key")
    }

    #[test]
    fn base_url_is_normalized() {
        let connector = connector();
        assert_eq!(connector.base_url, "http://127.0.0.1:1");
        assert!(!connector.is_connected());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = ConnectorConfig {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: 0.0,
            ..ConnectorConfig::default()
        };
        let connector = ClientConnector::with_config("http://h", "c", "k", config);
        assert_eq!(connector.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(connector.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(connector.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(connector.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(connector.backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_jitter_is_bounded() {
        let config = ConnectorConfig {
            backoff_base: Duration::from_secs(8),
            backoff_jitter: 0.1,
            ..ConnectorConfig::default()
        };
        let connector = ClientConnector::with_config("http://h", "c", "k", config);
        for _ in 0..100 {
            let delay = connector.backoff_delay(0);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs_f64(8.8));
        }
    }

    #[test]
    fn build_request_signs_with_the_effective_client_id() {
        let connector = connector();
        let request = connector
            .build_request("other_client", "add", &serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(request.client_id, "other_client");
        assert!(signature::verify(
            "key",
            "add",
            "other_client",
            request.timestamp,
            &request.signature,
        ));
    }

    #[tokio::test]
    async fn invoke_without_server_reports_not_connected() {
        let config = ConnectorConfig {
            reconnect_attempts: 1,
            backoff_base: Duration::from_millis(1),
            ..ConnectorConfig::default()
        };
        let connector = ClientConnector::with_config("http://127.0.0.1:1", "c", "k", config);
        let err = connector
            .invoke_method("ping", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        // A refused call never touches the breaker.
        assert_eq!(connector.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_returns_false() {
        let connector = connector();
        assert!(!connector.connect().await);
        assert!(!connector.is_connected());
    }
}
