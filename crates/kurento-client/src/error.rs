//! Kurento client errors

use rvoip_signaling_core::BackendError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KurentoError>;

#[derive(Debug, Error)]
pub enum KurentoError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Connection to the media server closed")]
    Closed,

    #[error("Malformed response to {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl KurentoError {
    pub fn protocol(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            message: message.into(),
        }
    }
}

impl From<KurentoError> for BackendError {
    fn from(e: KurentoError) -> Self {
        match e {
            KurentoError::Rpc { method, code, message } => BackendError::rejected(method, code, message),
            KurentoError::Timeout { method, timeout_ms } => BackendError::Timeout {
                operation: method,
                timeout_ms,
            },
            KurentoError::Closed => BackendError::Closed,
            KurentoError::Protocol { method, message } => BackendError::protocol(method, message),
            e @ (KurentoError::Connect { .. } | KurentoError::Encode(_)) => BackendError::transport(e.to_string()),
        }
    }
}
