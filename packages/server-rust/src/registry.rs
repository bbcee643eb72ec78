//! Method and resource registry.
//!
//! Handlers are trait objects behind `Arc`, stored in a `DashMap` so
//! registration and lookup are lock-free from the dispatch path. Resources
//! have no handler; they exist so capability discovery can advertise them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshlink_core::{Capability, CapabilityKind};
use serde_json::Value;
use tracing::info;

/// An invocable method handler.
///
/// Implementations receive the decoded parameter value and the calling
/// client id, and return either a JSON result or an error that dispatch
/// reports as an `ERROR` response. Handlers must never panic the server;
/// fallible work returns `Err`.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn execute(&self, params: Value, client_id: &str) -> anyhow::Result<Value>;
}

/// Adapter turning a plain closure into a [`MethodHandler`].
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(Value, &str) -> anyhow::Result<Value> + Send + Sync,
{
    async fn execute(&self, params: Value, client_id: &str) -> anyhow::Result<Value> {
        (self.f)(params, client_id)
    }
}

/// A registered method: its handler plus the permission dispatch enforces.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub handler: Arc<dyn MethodHandler>,
    pub required_permission: String,
}

/// A registered resource, advertised through discovery only.
#[derive(Debug, Clone)]
pub struct RegisteredResource {
    pub description: String,
    pub required_permission: String,
}

/// Concurrent registry of methods and resources.
#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, RegisteredMethod>,
    resources: DashMap<String, RegisteredResource>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method handler. Re-registering an id replaces the old
    /// handler.
    pub fn register(
        &self,
        method_id: &str,
        required_permission: &str,
        handler: Arc<dyn MethodHandler>,
    ) {
        self.methods.insert(
            method_id.to_string(),
            RegisteredMethod {
                handler,
                required_permission: required_permission.to_string(),
            },
        );
        info!(method_id, required_permission, "registered method");
    }

    /// Registers a synchronous closure as a method handler.
    pub fn register_fn<F>(&self, method_id: &str, required_permission: &str, f: F)
    where
        F: Fn(Value, &str) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(method_id, required_permission, Arc::new(FnHandler { f }));
    }

    /// Registers a resource for capability discovery.
    pub fn register_resource(&self, resource_id: &str, description: &str, required_permission: &str) {
        self.resources.insert(
            resource_id.to_string(),
            RegisteredResource {
                description: description.to_string(),
                required_permission: required_permission.to_string(),
            },
        );
        info!(resource_id, required_permission, "registered resource");
    }

    /// Looks up a method by id.
    #[must_use]
    pub fn get(&self, method_id: &str) -> Option<RegisteredMethod> {
        self.methods.get(method_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, method_id: &str) -> bool {
        self.methods.contains_key(method_id)
    }

    /// Projects the registry into capabilities visible under `granted`,
    /// a predicate over required permissions.
    #[must_use]
    pub fn capabilities_where<P>(&self, granted: P) -> Vec<Capability>
    where
        P: Fn(&str) -> bool,
    {
        let mut caps: Vec<Capability> = self
            .methods
            .iter()
            .filter(|entry| granted(&entry.required_permission))
            .map(|entry| Capability {
                id: entry.key().clone(),
                name: entry.key().clone(),
                description: format!("Method: {}", entry.key()),
                kind: CapabilityKind::Method,
                required_permission: entry.required_permission.clone(),
            })
            .collect();
        caps.extend(
            self.resources
                .iter()
                .filter(|entry| granted(&entry.required_permission))
                .map(|entry| Capability {
                    id: entry.key().clone(),
                    name: entry.key().clone(),
                    description: entry.description.clone(),
                    kind: CapabilityKind::Resource,
                    required_permission: entry.required_permission.clone(),
                }),
        );
        caps.sort_by(|a, b| a.id.cmp(&b.id));
        caps
    }
}
