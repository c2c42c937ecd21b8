// ── Core error types ──
//
// Client-observable failures of the connection client. Transport-level
// errors from hubsock-api are folded into these through `From`. The type
// is `Clone` because memoized requests hand the same result to every
// waiter.

use serde_json::Value;
use thiserror::Error;

/// Reply the server sends when the session lacks a right.
pub(crate) const PERMISSION_ERROR: &str = "permissionError";

/// Unified error type for the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Not connected")]
    NotConnected,

    #[error("{operation} is allowed only in admin")]
    NotAllowed { operation: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    // ── Server replies ───────────────────────────────────────────────
    /// The server answered with an error value.
    #[error("{message}")]
    Server { message: String },

    #[error("May not read \"{operation}\"")]
    Denied { operation: String },

    #[error("Cannot read \"{operation}\"")]
    Unavailable { operation: String },

    #[error("Not supported: {feature}")]
    NotSupported { feature: String },

    // ── Caller / payload errors ──────────────────────────────────────
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid response to {operation}: {message}")]
    InvalidResponse { operation: String, message: String },
}

impl ConnectionError {
    /// Build a `Server` error from whatever the server put in the error slot.
    pub(crate) fn from_server(value: &Value) -> Self {
        let message = match value {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| value.to_string(), str::to_owned),
            other => other.to_string(),
        };
        Self::Server { message }
    }

    pub(crate) fn invalid_response(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidResponse {
            operation: operation.to_owned(),
            message: err.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout { .. } | Self::Transport(_)
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hubsock_api::Error> for ConnectionError {
    fn from(err: hubsock_api::Error) -> Self {
        match err {
            hubsock_api::Error::NotConnected => Self::NotConnected,
            hubsock_api::Error::Timeout { timeout_ms } => Self::Timeout {
                operation: "request".into(),
                timeout_ms,
            },
            hubsock_api::Error::Deserialization { message, .. } => Self::InvalidResponse {
                operation: "request".into(),
                message,
            },
            hubsock_api::Error::InvalidUrl(e) => Self::InvalidArgument {
                message: e.to_string(),
            },
            other => Self::Transport(other.to_string()),
        }
    }
}
