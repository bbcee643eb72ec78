//! Wire envelope types for the four protocol operations.
//!
//! All structs are plain serde types carried as JSON. Opaque payload fields
//! (`parameters`, `result`, `data`) are UTF-8 JSON byte blobs so methods can
//! take arbitrary structured arguments without envelope schema changes; see
//! [`crate::payload`] for the codec.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Terminal status of a method invocation.
///
/// Variants serialize in `SCREAMING_SNAKE_CASE` to match the protocol's
/// status names exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
    NotFound,
    Unauthorized,
}

/// Liveness status reported by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
    NotServing,
}

/// Whether a capability is an invocable method or an accessible resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityKind {
    Method,
    Resource,
}

// ---------------------------------------------------------------------------
// Request / response envelopes
// ---------------------------------------------------------------------------

/// A signed method-invocation request. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRequest {
    pub method_id: String,
    /// UTF-8 JSON-encoded argument map.
    pub parameters: Vec<u8>,
    pub request_id: Uuid,
    pub client_id: String,
    pub api_key: String,
    /// Unix seconds at signing time; bounded by the replay window.
    pub timestamp: u64,
    /// Hex-encoded HMAC-SHA256 over the canonical message.
    pub signature: String,
}

/// Response to a [`MethodRequest`], correlated via `request_id`.
///
/// Invariant: `status == Success` iff `result` is populated and
/// `error_message` is empty; the inverse holds for every other status.
/// Use [`MethodResponse::success`] / [`MethodResponse::failure`] so the
/// invariant cannot be violated by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    /// UTF-8 JSON-encoded handler result. Empty unless `status == Success`.
    pub result: Vec<u8>,
    /// Human-readable failure description. Empty iff `status == Success`.
    pub error_message: String,
}

impl MethodResponse {
    /// Builds a `Success` response carrying the encoded handler result.
    #[must_use]
    pub fn success(request_id: Uuid, result: Vec<u8>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            result,
            error_message: String::new(),
        }
    }

    /// Builds a failure response for any non-`Success` status.
    ///
    /// # Panics
    ///
    /// Debug-panics if called with `ResponseStatus::Success`; a success
    /// response must carry a result, not a message.
    #[must_use]
    pub fn failure(request_id: Uuid, status: ResponseStatus, message: impl Into<String>) -> Self {
        debug_assert!(status != ResponseStatus::Success, "failure() with Success status");
        Self {
            request_id,
            status,
            result: Vec::new(),
            error_message: message.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Capability discovery
// ---------------------------------------------------------------------------

/// A method or resource the calling client is entitled to use.
///
/// Derived per request from the registry, filtered by the caller's
/// permissions; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub required_permission: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub client_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub capabilities: Vec<Capability>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// First frame a client sends on the event stream to open a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub client_id: String,
    pub api_key: String,
    /// Prefix-wildcard pattern matched against `event_type` (see
    /// [`crate::pattern`]).
    pub pattern: String,
    /// Caller-chosen subscription id; the server assigns one when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subscription_id: Option<Uuid>,
}

/// A pushed event. Ephemeral; constructed at broadcast time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNotification {
    pub event_id: Uuid,
    pub event_type: String,
    /// UTF-8 JSON-encoded event payload.
    pub data: Vec<u8>,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
