//! Client-side error taxonomy.

use meshlink_core::ResponseStatus;

/// Errors surfaced by the connector and multi-server client.
///
/// `Rpc` wraps a non-success response from the server; everything else is
/// local. `CircuitOpen` means the call was never sent.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The circuit breaker is open; the call was rejected without a send.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Not connected and reconnection failed.
    #[error("not connected to server")]
    NotConnected,

    /// The named server was never added to the multi-server client.
    #[error("server '{0}' not configured")]
    UnknownServer(String),

    /// Transport-level failure (connect, send, or response read).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("{message}")]
    Rpc {
        status: ResponseStatus,
        message: String,
    },

    /// Payload encode/decode failure.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ClientError {
    /// The response status for `Rpc` errors, `None` for local failures.
    #[must_use]
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            Self::Rpc { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
