//! Facade over several named server connections.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::connector::ClientConnector;
use crate::error::ClientError;

/// Routes calls to named [`ClientConnector`]s and aggregates cross-server
/// workflows.
#[derive(Default)]
pub struct MultiServerClient {
    servers: HashMap<String, Arc<ClientConnector>>,
}

/// Daily agenda aggregated from the weather, calendar, and todo servers.
///
/// Fields from unreachable servers stay empty; a partial agenda is still
/// an agenda.
#[derive(Debug, Clone, Serialize)]
pub struct Agenda {
    pub date: String,
    pub weather: Option<Value>,
    pub events: Vec<Value>,
    pub tasks: Vec<Value>,
}

impl MultiServerClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under a server name. Replaces any previous
    /// connector of the same name.
    pub fn add_server(&mut self, name: &str, connector: Arc<ClientConnector>) {
        info!(name, "added server");
        self.servers.insert(name.to_string(), connector);
    }

    #[must_use]
    pub fn server(&self, name: &str) -> Option<&Arc<ClientConnector>> {
        self.servers.get(name)
    }

    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Connects every registered server. Returns `true` only if all
    /// connections succeeded; failures are logged per server.
    pub async fn connect_all(&self) -> bool {
        let mut all_connected = true;
        for (name, connector) in &self.servers {
            if !connector.connect().await {
                warn!(name, "server connection failed");
                all_connected = false;
            }
        }
        all_connected
    }

    /// Disconnects every registered server.
    pub fn close_all(&self) {
        for connector in self.servers.values() {
            connector.close();
        }
    }

    /// Invokes a method on the named server. When `client_id` is given the
    /// request is signed under that identity instead of the connector's
    /// default.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownServer`] for an unregistered name, or
    /// whatever the underlying connector invocation fails with.
    pub async fn invoke_method(
        &self,
        server_name: &str,
        method_id: &str,
        parameters: &Value,
        client_id: Option<&str>,
    ) -> Result<Value, ClientError> {
        let connector = self
            .servers
            .get(server_name)
            .ok_or_else(|| ClientError::UnknownServer(server_name.to_string()))?;
        match client_id {
            Some(id) => connector.invoke_method_as(id, method_id, parameters).await,
            None => connector.invoke_method(method_id, parameters).await,
        }
    }

    /// Builds today's agenda from the `weather`, `calendar`, and `todo`
    /// servers. Each source is optional and failure-tolerant: an
    /// unreachable or failing server leaves its section empty.
    pub async fn generate_agenda(&self, client_id: Option<&str>) -> Agenda {
        let mut agenda = Agenda {
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
            weather: None,
            events: Vec::new(),
            tasks: Vec::new(),
        };

        if self.servers.contains_key("weather") {
            match self
                .invoke_method("weather", "get_current_weather", &json!({}), client_id)
                .await
            {
                Ok(weather) => agenda.weather = Some(weather),
                Err(err) => error!(error = %err, "error getting weather"),
            }
        }

        if self.servers.contains_key("calendar") {
            match self
                .invoke_method("calendar", "get_today_events", &json!({}), client_id)
                .await
            {
                Ok(result) => {
                    if let Some(events) = result.get("events").and_then(Value::as_array) {
                        agenda.events = events.clone();
                    }
                }
                Err(err) => error!(error = %err, "error getting calendar events"),
            }
        }

        if self.servers.contains_key("todo") {
            match self
                .invoke_method("todo", "get_tasks", &json!({}), client_id)
                .await
            {
                Ok(result) => {
                    if let Some(tasks) = result.get("tasks").and_then(Value::as_array) {
                        agenda.tasks = tasks.clone();
                        sort_tasks_by_priority(&mut agenda.tasks);
                    }
                }
                Err(err) => error!(error = %err, "error getting tasks"),
            }
        }

        agenda
    }
}

/// Orders tasks high, medium, low; a missing priority counts as medium and
/// unknown values sort last. The sort is stable, preserving server order
/// within each priority.
pub fn sort_tasks_by_priority(tasks: &mut [Value]) {
    for task in tasks.iter_mut() {
        if task.is_object() && task.get("priority").is_none() {
            task["priority"] = json!("medium");
        }
    }
    tasks.sort_by_key(|task| priority_rank(task));
}

fn priority_rank(task: &Value) -> u8 {
    match task
        .get("priority")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("high") => 0,
        Some("medium") | None => 1,
        Some("low") => 2,
        Some(_) => 3,
    }
}
