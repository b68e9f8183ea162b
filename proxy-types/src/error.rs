//! Standard Matrix error bodies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known `errcode` values used by either side of the relay.
pub mod errcode {
    /// The access token is not recognised by the homeserver.
    pub const UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";
    /// No access token was supplied.
    pub const MISSING_TOKEN: &str = "M_MISSING_TOKEN";
    /// The requested resource does not exist.
    pub const NOT_FOUND: &str = "M_NOT_FOUND";
    /// The request body was not valid JSON.
    pub const BAD_JSON: &str = "M_BAD_JSON";
    /// Catch-all error code.
    pub const UNKNOWN: &str = "M_UNKNOWN";
    /// The downstream receiver has no websocket to push the transaction to.
    pub const WS_NOT_CONNECTED: &str = "FI.MAU.WS_NOT_CONNECTED";
    /// The target exists but no sync loop is running for it.
    pub const NOT_ACTIVE: &str = "FI.MAU.SYNCPROXY.NOT_ACTIVE";
    /// Persisting the target failed.
    pub const UPSERT_FAILED: &str = "FI.MAU.SYNCPROXY.UPSERT_FAILED";
    /// The target's delivery address could not be used.
    pub const INVALID_ADDRESS: &str = "FI.MAU.SYNCPROXY.INVALID_ADDRESS";
    /// The sync loop did not acknowledge a stop request in time.
    pub const STOP_TIMEOUT: &str = "FI.MAU.SYNCPROXY.STOP_TIMEOUT";
}

/// A Matrix error response body (`{"errcode": ..., "error": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{errcode}: {message}")]
pub struct MatrixError {
    /// Machine-readable error code.
    pub errcode: String,
    /// Human-readable message.
    #[serde(rename = "error", default)]
    pub message: String,
}

impl MatrixError {
    /// Create an error body.
    pub fn new(errcode: &str, message: impl Into<String>) -> Self {
        Self {
            errcode: errcode.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error carries the given code.
    pub fn is(&self, errcode: &str) -> bool {
        self.errcode == errcode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MatrixError::new(errcode::UNKNOWN_TOKEN, "Invalid access token");
        assert_eq!(err.to_string(), "M_UNKNOWN_TOKEN: Invalid access token");
    }

    #[test]
    fn decodes_without_message() {
        let err: MatrixError =
            serde_json::from_str(r#"{"errcode":"FI.MAU.WS_NOT_CONNECTED"}"#).unwrap();
        assert!(err.is(errcode::WS_NOT_CONNECTED));
        assert!(err.message.is_empty());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MatrixError>();
    }
}
