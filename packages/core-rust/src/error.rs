//! Per-request dispatch failure taxonomy.
//!
//! Each variant maps onto exactly one non-success [`ResponseStatus`], so a
//! failed invocation always reaches the caller as a distinguishable
//! classification, never as silently empty data.

use crate::envelope::ResponseStatus;

/// Terminal per-request failures produced by the dispatch pipeline.
///
/// Authentication, signature, permission, and lookup failures are final:
/// retrying them cannot succeed without client reconfiguration. Handler
/// failures are captured here too so a misbehaving handler surfaces as an
/// `Error` response instead of killing the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Invalid request signature")]
    InvalidSignature,
    #[error("Method {method_id} not found")]
    MethodNotFound { method_id: String },
    #[error("Permission denied: {required} required")]
    PermissionDenied { required: String },
    #[error("Error executing method: {0}")]
    Handler(String),
}

impl DispatchError {
    /// The wire status this failure reports as.
    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::Malformed(_) | Self::Handler(_) => ResponseStatus::Error,
            Self::AuthenticationFailed | Self::InvalidSignature | Self::PermissionDenied { .. } => {
                ResponseStatus::Unauthorized
            }
            Self::MethodNotFound { .. } => ResponseStatus::NotFound,
        }
    }
}
