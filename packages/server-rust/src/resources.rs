//! Stateful resource methods: key-value storage, counters, TTL locks, and
//! a paginated transaction log.
//!
//! All state is in-process. Lock acquisition polls at a fixed interval
//! until the caller's timeout elapses; expiry and deadlines use the tokio
//! clock so tests can run against a paused clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshlink_core::signature;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::registry::{MethodHandler, MethodRegistry};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Value,
    stored_at: u64,
}

#[derive(Debug, Clone)]
struct LockEntry {
    lock_id: String,
    client_id: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// One audit record per mutating resource operation.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub operation: String,
    pub resource: String,
    pub client_id: String,
    pub timestamp: u64,
}

/// In-process backing store for the resource methods.
#[derive(Debug, Default)]
pub struct ResourceStore {
    data: DashMap<String, StoredRecord>,
    counters: DashMap<String, i64>,
    locks: DashMap<String, LockEntry>,
    log: Mutex<Vec<LogEntry>>,
}

impl ResourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, operation: &str, resource: &str, client_id: &str) {
        self.log.lock().push(LogEntry {
            operation: operation.to_string(),
            resource: resource.to_string(),
            client_id: client_id.to_string(),
            timestamp: signature::unix_timestamp(),
        });
    }

    fn store_data(&self, params: &Value, client_id: &str) -> anyhow::Result<Value> {
        let key = require_str(params, "key")?;
        let Some(value) = params.get("value") else {
            anyhow::bail!("Missing required parameter 'value'");
        };
        let stored_at = signature::unix_timestamp();
        self.data.insert(
            key.to_string(),
            StoredRecord {
                value: value.clone(),
                stored_at,
            },
        );
        self.record("store", key, client_id);
        info!(key, client_id, "stored data");
        Ok(json!({
            "status": "success",
            "message": format!("Data stored for key '{key}'"),
            "timestamp": stored_at,
        }))
    }

    fn retrieve_data(&self, params: &Value, client_id: &str) -> anyhow::Result<Value> {
        let key = require_str(params, "key")?;
        let Some(record) = self.data.get(key) else {
            anyhow::bail!("No data found for key '{key}'");
        };
        self.record("retrieve", key, client_id);
        Ok(json!({
            "status": "success",
            "data": record.value,
            "metadata": {"stored_at": record.stored_at},
        }))
    }

    fn increment_counter(&self, params: &Value, client_id: &str) -> anyhow::Result<Value> {
        let counter_id = require_str(params, "counter_id")?;
        let increment_by = params
            .get("increment_by")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let mut entry = self.counters.entry(counter_id.to_string()).or_insert(0);
        let previous = *entry;
        // Overflow is a handler error, never a wrap or a panic.
        let Some(current) = previous.checked_add(increment_by) else {
            drop(entry);
            anyhow::bail!("Counter '{counter_id}' cannot hold the incremented value");
        };
        *entry = current;
        drop(entry);
        self.record("increment", counter_id, client_id);
        Ok(json!({
            "status": "success",
            "counter_id": counter_id,
            "previous_value": previous,
            "current_value": current,
        }))
    }

    /// Single atomic acquisition attempt. An expired holder is evicted.
    fn try_acquire(&self, resource_id: &str, client_id: &str, ttl: Duration) -> Option<String> {
        let lock_id = Uuid::new_v4().to_string();
        let entry = LockEntry {
            lock_id: lock_id.clone(),
            client_id: client_id.to_string(),
            acquired_at: Instant::now(),
            ttl,
        };
        match self.locks.entry(resource_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    debug!(resource_id, "evicting expired lock");
                    occupied.insert(entry);
                    Some(lock_id)
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Some(lock_id)
            }
        }
    }

    async fn acquire_lock(&self, params: &Value, client_id: &str) -> anyhow::Result<Value> {
        let resource_id = require_str(params, "resource_id")?.to_string();
        let timeout = duration_param(params, "timeout", 5.0)?;
        let ttl = duration_param(params, "ttl", 30.0)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock_id) = self.try_acquire(&resource_id, client_id, ttl) {
                self.record("lock_acquire", &resource_id, client_id);
                info!(resource_id, client_id, lock_id, "lock acquired");
                return Ok(json!({
                    "status": "success",
                    "resource_id": resource_id,
                    "lock_id": lock_id,
                    "ttl": ttl.as_secs_f64(),
                }));
            }
            if Instant::now() >= deadline {
                let holder = self
                    .locks
                    .get(&resource_id)
                    .map(|entry| entry.client_id.clone());
                anyhow::bail!(
                    "Could not acquire lock for resource '{resource_id}' within timeout (held by {})",
                    holder.as_deref().unwrap_or("unknown")
                );
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    fn release_lock(&self, params: &Value, client_id: &str) -> anyhow::Result<Value> {
        let resource_id = require_str(params, "resource_id")?;
        let lock_id = require_str(params, "lock_id")?;

        let Some(entry) = self.locks.get(resource_id) else {
            anyhow::bail!("No lock exists for resource '{resource_id}'");
        };
        if entry.lock_id != lock_id || entry.client_id != client_id {
            anyhow::bail!("Lock for resource '{resource_id}' is not held by this client");
        }
        drop(entry);

        self.locks.remove(resource_id);
        self.record("lock_release", resource_id, client_id);
        info!(resource_id, client_id, "lock released");
        Ok(json!({
            "status": "success",
            "resource_id": resource_id,
        }))
    }

    fn get_transaction_log(&self, params: &Value, _client_id: &str) -> anyhow::Result<Value> {
        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(10);
        let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);

        let log = self.log.lock();
        let total = log.len();
        let page: Vec<&LogEntry> = log.iter().skip(offset).take(limit).collect();
        let logs = serde_json::to_value(&page)?;
        drop(log);

        Ok(json!({
            "status": "success",
            "logs": logs,
            "pagination": {
                "total": total,
                "offset": offset,
                "limit": limit,
                "has_more": offset.saturating_add(limit) < total,
            },
        }))
    }
}

fn require_str<'a>(params: &'a Value, name: &str) -> anyhow::Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter '{name}'"))
}

fn duration_param(params: &Value, name: &str, default_secs: f64) -> anyhow::Result<Duration> {
    let secs = params
        .get(name)
        .and_then(Value::as_f64)
        .unwrap_or(default_secs);
    // Bounded so Duration::from_secs_f64 cannot panic on absurd inputs.
    if !secs.is_finite() || secs < 0.0 || secs > 86_400.0 {
        anyhow::bail!("Parameter '{name}' must be between 0 and 86400 seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}

// ---------------------------------------------------------------------------
// Registry wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum ResourceMethod {
    StoreData,
    RetrieveData,
    IncrementCounter,
    AcquireLock,
    ReleaseLock,
    GetTransactionLog,
}

struct ResourceHandler {
    store: Arc<ResourceStore>,
    method: ResourceMethod,
}

#[async_trait]
impl MethodHandler for ResourceHandler {
    async fn execute(&self, params: Value, client_id: &str) -> anyhow::Result<Value> {
        match self.method {
            ResourceMethod::StoreData => self.store.store_data(&params, client_id),
            ResourceMethod::RetrieveData => self.store.retrieve_data(&params, client_id),
            ResourceMethod::IncrementCounter => self.store.increment_counter(&params, client_id),
            ResourceMethod::AcquireLock => self.store.acquire_lock(&params, client_id).await,
            ResourceMethod::ReleaseLock => self.store.release_lock(&params, client_id),
            ResourceMethod::GetTransactionLog => self.store.get_transaction_log(&params, client_id),
        }
    }
}

/// Registers all resource methods and their discovery entries.
pub fn register_resource_methods(registry: &MethodRegistry, store: &Arc<ResourceStore>) {
    let methods: [(&str, &str, ResourceMethod); 6] = [
        ("store_data", "write", ResourceMethod::StoreData),
        ("retrieve_data", "read", ResourceMethod::RetrieveData),
        ("increment_counter", "write", ResourceMethod::IncrementCounter),
        ("acquire_lock", "write", ResourceMethod::AcquireLock),
        ("release_lock", "write", ResourceMethod::ReleaseLock),
        ("get_transaction_log", "read", ResourceMethod::GetTransactionLog),
    ];
    for (method_id, permission, method) in methods {
        registry.register(
            method_id,
            permission,
            Arc::new(ResourceHandler {
                store: Arc::clone(store),
                method,
            }),
        );
    }

    registry.register_resource("data_store", "Key-value data store", "read");
    registry.register_resource("counters", "Named atomic counters", "read");
    registry.register_resource("locks", "TTL-bounded resource locks", "read");
    registry.register_resource("transaction_log", "Audit log of resource operations", "read");
}
