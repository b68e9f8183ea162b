//! Error types for syncproxy.
//!
//! Every failure the loop can observe is classified by variant: callers match
//! on the kind (fatal, terminal-clean, retryable, abandoned) instead of
//! comparing error values.

use std::path::PathBuf;
use syncproxy_types::{MatrixError, ProxyErrorCode, SendStatus};

/// Main error type for process-level operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Errors from the upstream homeserver.
#[derive(Debug, thiserror::Error)]
pub enum HomeserverError {
    /// The bot access token was rejected. Fatal for the sync loop.
    #[error("access token rejected: {0}")]
    UnknownToken(MatrixError),

    /// Non-success HTTP status.
    #[error("homeserver returned HTTP {status}: {error}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Decoded error body, or `M_UNKNOWN` with the raw body text.
        error: MatrixError,
    },

    /// Connection, TLS or timeout failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The homeserver URL could not be combined with the request path.
    #[error("invalid homeserver URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors from delivering a transaction or error notification downstream.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The target has no `hs_token`; nothing is sent.
    #[error("target is missing hs_token")]
    MissingHsToken,

    /// The target address can't be turned into a delivery URL.
    #[error("failed to form transaction URL: {0}")]
    InvalidAddress(#[from] url::ParseError),

    /// The receiver's websocket to the appservice is down. Not retried: the
    /// receiver asks for sync to be restarted once it reconnects.
    #[error("server said the transaction websocket is not connected")]
    WebsocketNotConnected,

    /// The loop was asked to stop.
    #[error("delivery cancelled")]
    Cancelled,

    /// The payload couldn't be serialized.
    #[error("failed to encode transaction JSON: {0}")]
    Encode(#[from] serde_json::Error),

    /// Connection, TLS or timeout failure.
    #[error("failed to send transaction: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status with a JSON error body.
    #[error("transaction returned HTTP {status}: {error}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Decoded error body.
        error: MatrixError,
    },

    /// Non-success status with a body that isn't a Matrix error.
    #[error("transaction returned HTTP {status} and non-JSON body")]
    NonJsonError {
        /// HTTP status code.
        status: u16,
    },

    /// Success status but the body didn't decode.
    #[error("transaction returned HTTP {status}, but had non-JSON body: {reason}")]
    MalformedResponse {
        /// HTTP status code.
        status: u16,
        /// Decoder message.
        reason: String,
    },

    /// Synchronous confirmation is required but the receiver didn't offer it.
    #[error("transaction returned HTTP {status}, but synchronous delivery is required and the server didn't confirm support for it")]
    SynchronousNotSupported {
        /// HTTP status code.
        status: u16,
    },

    /// Synchronous response without the per-target status map.
    #[error("transaction returned HTTP {status}, but synchronous delivery confirmation was missing `com.beeper.asmux.sent_to`")]
    MissingSentTo {
        /// HTTP status code.
        status: u16,
    },

    /// The receiver reported a status other than `ok` for this target.
    #[error("transaction returned HTTP {status}, but server said it didn't reach the appservice (status {send_status})")]
    NotDelivered {
        /// HTTP status code.
        status: u16,
        /// Reported delivery status.
        send_status: SendStatus,
    },

    /// Synchronous response that doesn't mention this target at all.
    #[error("transaction returned HTTP {status}, but server didn't confirm synchronous delivery")]
    NotConfirmed {
        /// HTTP status code.
        status: u16,
    },
}

impl DeliveryError {
    /// Whether the send should be attempted again after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::MissingHsToken
            | DeliveryError::InvalidAddress(_)
            | DeliveryError::WebsocketNotConnected
            | DeliveryError::Cancelled
            | DeliveryError::Encode(_) => false,
            DeliveryError::Transport(_)
            | DeliveryError::HttpStatus { .. }
            | DeliveryError::NonJsonError { .. }
            | DeliveryError::MalformedResponse { .. }
            | DeliveryError::SynchronousNotSupported { .. }
            | DeliveryError::MissingSentTo { .. }
            | DeliveryError::NotDelivered { .. }
            | DeliveryError::NotConfirmed { .. } => true,
        }
    }
}

/// Why a sync loop stopped.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The loop was asked to stop.
    #[error("syncing cancelled")]
    Cancelled,

    /// The homeserver rejected the bot access token.
    #[error("access token rejected: {0}")]
    UnknownToken(MatrixError),

    /// The receiver's websocket is down; it will restart syncing itself.
    #[error("downstream websocket is not connected")]
    DownstreamDisconnected,

    /// A delivery failed in a way retrying can't fix.
    #[error("error sending transaction: {0}")]
    Delivery(DeliveryError),
}

impl SyncError {
    /// Whether the loop ended without anything to report to the target.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::DownstreamDisconnected
        )
    }

    /// Error kind to report to the target.
    pub fn proxy_error_code(&self) -> ProxyErrorCode {
        match self {
            SyncError::UnknownToken(_) => ProxyErrorCode::LoggedOut,
            _ => ProxyErrorCode::Unknown,
        }
    }
}

impl From<DeliveryError> for SyncError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Cancelled => SyncError::Cancelled,
            DeliveryError::WebsocketNotConnected => SyncError::DownstreamDisconnected,
            other => SyncError::Delivery(other),
        }
    }
}

/// Outcome of a control-plane start or stop request that didn't succeed.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// No target with that ID is known.
    #[error("no appservice found with that ID")]
    NotFound,

    /// The target exists but no loop is running.
    #[error("that appservice is not active")]
    NotActive,

    /// The downstream address can't be used.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The target record couldn't be persisted.
    #[error("failed to insert appservice details into database: {0}")]
    UpsertFailed(#[source] StorageError),

    /// The loop didn't acknowledge cancellation in time.
    #[error("syncing did not stop within the configured timeout")]
    StopTimeout,
}

/// Result type alias for process-level operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
