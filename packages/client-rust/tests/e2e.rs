//! End-to-end tests running real connectors against an in-process server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshlink_client::{
    BreakerConfig, CircuitState, ClientConnector, ClientError, ConnectorConfig,
};
use meshlink_core::{MethodResponse, ResponseStatus, SubscribeRequest};
use meshlink_server::{AuthProvider, DispatchServer, NetworkConfig, NetworkModule};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

const KEY1: &str = "sk_client1_12345abcde";
const KEY2: &str = "sk_client2_67890fghij";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}

struct TestServer {
    base_url: String,
    port: u16,
    dispatch: Arc<DispatchServer>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> TestServer {
    start_server_on(0).await
}

/// Starts a server on `port` (0 for OS-assigned). A non-zero port retries
/// the bind briefly so a restart can reclaim a just-freed address.
async fn start_server_on(port: u16) -> TestServer {
    init_tracing();
    let auth = Arc::new(AuthProvider::new());
    auth.register_client("client1", KEY1, ["read", "write", "subscribe"]);
    auth.register_client("client2", KEY2, ["read"]);

    let dispatch = Arc::new(DispatchServer::new(auth));
    dispatch.registry().register_fn("add", "read", |params, _| {
        let a = params.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = params.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(json!({"result": a + b}))
    });
    dispatch
        .registry()
        .register_fn("multiply", "write", |params, _| {
            let a = params.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = params.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            Ok(json!({"result": a * b}))
        });
    dispatch
        .registry()
        .register_fn("boom", "read", |_, _| anyhow::bail!("always fails"));

    let config = NetworkConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(config, Arc::clone(&dispatch));
    let mut bound = None;
    for _ in 0..250 {
        match module.start().await {
            Ok(port) => {
                bound = Some(port);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let port = bound.expect("bind test server");

    let (tx, rx) = oneshot::channel();
    tokio::spawn(module.serve(async move {
        let _ = rx.await;
    }));

    // Wait for the server to report ready.
    let base_url = format!("http://127.0.0.1:{port}");
    let http = reqwest::Client::new();
    wait_for(|| {
        let http = http.clone();
        let url = format!("{base_url}/health/ready");
        async move {
            matches!(http.get(&url).send().await, Ok(resp) if resp.status().is_success())
        }
    })
    .await;

    TestServer {
        base_url,
        port,
        dispatch,
        shutdown: Some(tx),
    }
}

/// Polls `cond` every 10ms for up to 5s, panicking on timeout.
async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn fast_config() -> ConnectorConfig {
    ConnectorConfig {
        reconnect_attempts: 2,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(10),
        ..ConnectorConfig::default()
    }
}

#[tokio::test]
async fn connect_discovers_permission_filtered_capabilities() {
    let server = start_server().await;
    let connector = ClientConnector::with_config(&server.base_url, "client2", KEY2, fast_config());

    assert!(connector.connect().await);
    assert!(connector.is_connected());

    let caps = connector.capabilities();
    assert!(caps.contains_key("add"));
    assert!(caps.contains_key("ping"));
    assert!(
        !caps.contains_key("multiply"),
        "write-gated method visible to read-only client"
    );
}

#[tokio::test]
async fn writer_invokes_write_method_and_reader_is_denied() {
    let server = start_server().await;

    let writer = ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config());
    assert!(writer.connect().await);
    let result = writer
        .invoke_method("multiply", &json!({"a": 6, "b": 7}))
        .await
        .unwrap();
    assert_eq!(result["result"], 42.0);

    let reader = ClientConnector::with_config(&server.base_url, "client2", KEY2, fast_config());
    assert!(reader.connect().await);
    let err = reader
        .invoke_method("multiply", &json!({"a": 6, "b": 7}))
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc { status, message } => {
            assert_eq!(status, ResponseStatus::Unauthorized);
            assert_eq!(message, "Permission denied: write required");
        }
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_method_reports_not_found() {
    let server = start_server().await;
    let connector = ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config());
    assert!(connector.connect().await);

    let err = connector
        .invoke_method("frobnicate", &json!({}))
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc { status, message } => {
            assert_eq!(status, ResponseStatus::NotFound);
            assert_eq!(message, "Method frobnicate not found");
        }
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_connectors_have_independent_breakers() {
    let server = start_server().await;

    let failing_config = ConnectorConfig {
        breaker: BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        },
        ..fast_config()
    };
    let failing =
        ClientConnector::with_config(&server.base_url, "client1", KEY1, failing_config);
    let healthy = ClientConnector::with_config(&server.base_url, "client2", KEY2, fast_config());
    assert!(failing.connect().await);
    assert!(healthy.connect().await);

    // Trip the failing connector's breaker with two handler failures.
    for _ in 0..2 {
        let err = failing.invoke_method("boom", &json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc { .. }));
    }
    assert_eq!(failing.breaker().state(), CircuitState::Open);
    let err = failing.invoke_method("boom", &json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::CircuitOpen));

    // The other connector is unaffected, before and after.
    let result = healthy
        .invoke_method("add", &json!({"a": 1, "b": 2}))
        .await
        .unwrap();
    assert_eq!(result["result"], 3.0);
    assert_eq!(healthy.breaker().state(), CircuitState::Closed);
}

/// Reconnect settings patient enough to outlast a server restart.
fn patient_config() -> ConnectorConfig {
    ConnectorConfig {
        reconnect_attempts: 50,
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(50),
        ..ConnectorConfig::default()
    }
}

#[tokio::test]
async fn transport_failure_is_recovered_by_a_single_retry() {
    let server = start_server().await;
    let port = server.port;
    let connector =
        ClientConnector::with_config(&server.base_url, "client1", KEY1, patient_config());
    assert!(connector.connect().await);

    // Kill the server; the connector still believes it is connected, so the
    // next send hits a dead port. A replacement comes up on the same port
    // while the connector walks its reconnect backoff.
    drop(server);
    let replacement = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        start_server_on(port).await
    });

    let result = connector
        .invoke_method("add", &json!({"a": 2, "b": 2}))
        .await
        .unwrap();
    assert_eq!(result["result"], 4.0);
    assert!(connector.is_connected());

    // With no server at all the retry budget is exhausted and the transport
    // failure surfaces to the caller.
    let replacement = replacement.await.unwrap();
    drop(replacement);
    let err = connector
        .invoke_method("add", &json!({"a": 1, "b": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)), "got {err:?}");
    assert!(!connector.is_connected());
}

#[tokio::test]
async fn event_listener_resumes_after_server_restart() {
    let server = start_server().await;
    let port = server.port;
    let connector =
        ClientConnector::with_config(&server.base_url, "client1", KEY1, patient_config());
    assert!(connector.connect().await);

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    connector
        .subscribe_to_events(
            "sys.*",
            Arc::new(move |event_type, _| {
                sink.lock().push(event_type.to_string());
                Ok(())
            }),
        )
        .await
        .unwrap();

    let broker = server.dispatch.broker();
    wait_for(|| {
        let broker = broker.clone();
        async move { broker.subscriber_count() == 1 }
    })
    .await;
    broker.broadcast("sys.start", &json!({}));
    let seen = Arc::clone(&received);
    wait_for(|| {
        let seen = Arc::clone(&seen);
        async move { !seen.lock().is_empty() }
    })
    .await;

    // Restart the server on the same port. The listener's stream breaks,
    // the connector reconnects, and the subscription is re-established
    // without another subscribe call.
    drop(server);
    let server = start_server_on(port).await;
    let broker = server.dispatch.broker();
    wait_for(|| {
        let broker = broker.clone();
        async move { broker.subscriber_count() == 1 }
    })
    .await;

    broker.broadcast("sys.resume", &json!({}));
    let seen = Arc::clone(&received);
    wait_for(|| {
        let seen = Arc::clone(&seen);
        async move { seen.lock().len() >= 2 }
    })
    .await;
    assert_eq!(*received.lock(), vec!["sys.start", "sys.resume"]);
    connector.close();
}

#[tokio::test]
async fn subscribed_handler_receives_only_matching_events() {
    let server = start_server().await;
    let connector = ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config());
    assert!(connector.connect().await);

    let received: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    connector
        .subscribe_to_events(
            "sys.*",
            Arc::new(move |event_type, data| {
                sink.lock().push((event_type.to_string(), data.clone()));
                Ok(())
            }),
        )
        .await
        .unwrap();

    // Wait for the listener's subscription to register server-side.
    let broker = server.dispatch.broker();
    wait_for(|| {
        let broker = broker.clone();
        async move { broker.subscriber_count() == 1 }
    })
    .await;

    broker.broadcast("sys.start", &json!({"pid": 42}));
    broker.broadcast("net.up", &json!({"iface": "eth0"}));
    broker.broadcast("sys.stop", &json!({}));

    let matched = Arc::clone(&received);
    wait_for(|| {
        let matched = Arc::clone(&matched);
        async move { matched.lock().len() >= 2 }
    })
    .await;

    let events = received.lock();
    let types: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(types, vec!["sys.start", "sys.stop"]);
    assert_eq!(events[0].1["pid"], 42);
    connector.close();
}

#[tokio::test]
async fn subscription_without_permission_is_closed_by_server() {
    let server = start_server().await;
    let ws_url = format!("{}/events", server.base_url.replacen("http", "ws", 1));
    let (mut stream, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();

    // client2 lacks the subscribe permission.
    let subscribe = SubscribeRequest {
        client_id: "client2".to_string(),
        api_key: KEY2.to_string(),
        pattern: "*".to_string(),
        subscription_id: None,
    };
    stream
        .send(tokio_tungstenite::tungstenite::Message::text(
            serde_json::to_string(&subscribe).unwrap(),
        ))
        .await
        .unwrap();

    let reply = stream.next().await.unwrap().unwrap();
    match reply {
        tokio_tungstenite::tungstenite::Message::Close(Some(frame)) => {
            assert!(frame.reason.contains("subscribe"));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(server.dispatch.broker().subscriber_count(), 0);
}

#[tokio::test]
async fn agenda_aggregates_across_servers_and_tolerates_failures() {
    let server = start_server().await;
    server
        .dispatch
        .registry()
        .register_fn("get_today_events", "read", |_, _| {
            Ok(json!({"events": [{"title": "standup", "time": "09:30"}]}))
        });
    server.dispatch.registry().register_fn("get_tasks", "read", |_, _| {
        Ok(json!({"tasks": [
            {"title": "water plants", "priority": "low"},
            {"title": "file taxes", "priority": "high"},
            {"title": "reply to mail"},
        ]}))
    });

    let mut client = meshlink_client::MultiServerClient::new();
    // Calendar and todo share the in-process server; weather points at a
    // dead port to exercise partial failure.
    client.add_server(
        "calendar",
        ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config()),
    );
    client.add_server(
        "todo",
        ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config()),
    );
    client.add_server(
        "weather",
        ClientConnector::with_config("http://127.0.0.1:1", "client1", KEY1, fast_config()),
    );
    assert!(!client.connect_all().await);

    let agenda = client.generate_agenda(None).await;
    assert!(agenda.weather.is_none());
    assert_eq!(agenda.events.len(), 1);
    assert_eq!(agenda.events[0]["title"], "standup");
    let titles: Vec<&str> = agenda
        .tasks
        .iter()
        .map(|t| t["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["file taxes", "reply to mail", "water plants"]);
}

#[tokio::test]
async fn per_call_client_id_override_is_signed_correctly() {
    let server = start_server().await;
    let mut client = meshlink_client::MultiServerClient::new();
    // The connector holds client1's key, so overriding to client2 must be
    // rejected: the signature cannot validate under client2's key.
    client.add_server(
        "main",
        ClientConnector::with_config(&server.base_url, "client1", KEY1, fast_config()),
    );
    assert!(client.connect_all().await);

    let ok = client
        .invoke_method("main", "add", &json!({"a": 1, "b": 1}), Some("client1"))
        .await
        .unwrap();
    assert_eq!(ok["result"], 2.0);

    let err = client
        .invoke_method("main", "add", &json!({"a": 1, "b": 1}), Some("client2"))
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc { status, .. } => assert_eq!(status, ResponseStatus::Unauthorized),
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_invoke_body_yields_protocol_error_envelope() {
    let server = start_server().await;
    let response = reqwest::Client::new()
        .post(format!("{}/invoke", server.base_url))
        .body("{definitely not an envelope")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let envelope: MethodResponse = response.json().await.unwrap();
    assert_eq!(envelope.status, ResponseStatus::Error);
    assert!(envelope.error_message.starts_with("Malformed request:"));
    assert!(envelope.request_id.is_nil());
}

#[tokio::test]
async fn tampered_signature_is_rejected_end_to_end() {
    let server = start_server().await;
    let timestamp = meshlink_core::signature::unix_timestamp();
    let request = meshlink_core::MethodRequest {
        method_id: "add".to_string(),
        parameters: b"{}".to_vec(),
        request_id: uuid::Uuid::new_v4(),
        client_id: "client1".to_string(),
        api_key: KEY1.to_string(),
        timestamp,
        // Signed for a different method.
        signature: meshlink_core::signature::sign(KEY1, "multiply", "client1", timestamp),
    };

    let response: MethodResponse = reqwest::Client::new()
        .post(format!("{}/invoke", server.base_url))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Unauthorized);
    assert_eq!(response.error_message, "Invalid request signature");
}
