//! Meshlink core: request/response envelope, request signatures, and event patterns.

pub mod envelope;
pub mod error;
pub mod pattern;
pub mod payload;
pub mod signature;

pub use envelope::{
    CapabilitiesResponse, Capability, CapabilityKind, DiscoveryRequest, EventNotification,
    HealthCheckRequest, HealthCheckResponse, HealthStatus, MethodRequest, MethodResponse,
    ResponseStatus, SubscribeRequest,
};
pub use error::DispatchError;
pub use pattern::pattern_matches;
pub use payload::{decode_payload, encode_payload};
