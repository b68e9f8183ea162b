//! Downstream appservice transaction payloads.
//!
//! A [`Transaction`] is what one sync iteration produced. On the wire it is
//! sent as a [`TransactionRequest`], which duplicates every part under its
//! unstable alias for receivers that only know the MSC names, and adds the
//! relay's own wrapped transaction ID and synchronous-delivery hint.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{DeviceLists, OtkCount, TargetId, ToDeviceEvent, UserId};

/// The relevant changes from one sync iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    /// To-device events, stamped with the recipient user and device.
    pub ephemeral: Vec<ToDeviceEvent>,
    /// Device list changes. `None` when nothing changed.
    pub device_lists: Option<DeviceLists>,
    /// One-time key counts. `None` when not being sent this time.
    pub device_one_time_keys_count: Option<BTreeMap<UserId, OtkCount>>,
}

impl Transaction {
    /// Whether there is nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.ephemeral.is_empty()
            && self.device_lists.is_none()
            && self.device_one_time_keys_count.is_none()
    }

    /// Number of users with device list changes.
    pub fn device_list_changes(&self) -> usize {
        self.device_lists
            .as_ref()
            .map(|lists| lists.changed.len())
            .unwrap_or(0)
    }
}

/// Wire form of a [`Transaction`].
#[derive(Debug, Serialize)]
pub struct TransactionRequest<'a> {
    /// Room events; always empty for this relay.
    pub events: &'a [serde_json::Value],
    /// To-device events (stable name).
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub ephemeral: &'a [ToDeviceEvent],
    /// To-device events (MSC2409 name).
    #[serde(
        rename = "de.sorunome.msc2409.ephemeral",
        skip_serializing_if = "is_empty_slice"
    )]
    pub msc2409_ephemeral: &'a [ToDeviceEvent],
    /// Device list changes (stable name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_lists: Option<&'a DeviceLists>,
    /// Device list changes (MSC3202 name).
    #[serde(
        rename = "org.matrix.msc3202.device_lists",
        skip_serializing_if = "Option::is_none"
    )]
    pub msc3202_device_lists: Option<&'a DeviceLists>,
    /// One-time key counts (stable name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_one_time_keys_count: Option<&'a BTreeMap<UserId, OtkCount>>,
    /// One-time key counts (MSC3202 name).
    #[serde(
        rename = "org.matrix.msc3202.device_one_time_keys_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub msc3202_device_one_time_keys_count: Option<&'a BTreeMap<UserId, OtkCount>>,
    /// The relay's own transaction ID.
    #[serde(rename = "fi.mau.syncproxy.transaction_id")]
    pub wrapped_txn_id: &'a str,
    /// Recipients that must confirm delivery synchronously.
    #[serde(rename = "com.beeper.asmux.synchronous_to")]
    pub synchronous_to: [&'a TargetId; 1],
}

fn is_empty_slice<T>(slice: &&[T]) -> bool {
    slice.is_empty()
}

impl<'a> TransactionRequest<'a> {
    /// Wrap a transaction for delivery to `target`.
    pub fn new(txn: &'a Transaction, wrapped_txn_id: &'a str, target: &'a TargetId) -> Self {
        Self {
            events: &[],
            ephemeral: &txn.ephemeral,
            msc2409_ephemeral: &txn.ephemeral,
            device_lists: txn.device_lists.as_ref(),
            msc3202_device_lists: txn.device_lists.as_ref(),
            device_one_time_keys_count: txn.device_one_time_keys_count.as_ref(),
            msc3202_device_one_time_keys_count: txn.device_one_time_keys_count.as_ref(),
            wrapped_txn_id,
            synchronous_to: [target],
        }
    }
}

/// Error kinds reported to a target when its sync loop dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyErrorCode {
    /// The bot access token was rejected by the homeserver.
    #[serde(rename = "FI.MAU.CLIENT_LOGGED_OUT")]
    LoggedOut,
    /// Anything else.
    #[serde(rename = "M_UNKNOWN")]
    Unknown,
}

impl ProxyErrorCode {
    /// The wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyErrorCode::LoggedOut => "FI.MAU.CLIENT_LOGGED_OUT",
            ProxyErrorCode::Unknown => "M_UNKNOWN",
        }
    }
}

/// Failure notification sent in place of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRequest {
    /// Coarse classification.
    #[serde(rename = "errcode")]
    pub code: ProxyErrorCode,
    /// Free-text description.
    #[serde(rename = "error")]
    pub message: String,
    /// The relay's own transaction ID, filled in at send time.
    #[serde(
        rename = "fi.mau.syncproxy.transaction_id",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub wrapped_txn_id: String,
}

impl ErrorRequest {
    /// Create a notification without a transaction ID.
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            wrapped_txn_id: String::new(),
        }
    }
}

/// Per-recipient delivery status in a synchronous confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SendStatus {
    /// Delivered to the appservice.
    Ok,
    /// The receiver has no websocket for this appservice right now.
    WebsocketNotConnected,
    /// Any other status string.
    Other(String),
}

impl From<String> for SendStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ok" => SendStatus::Ok,
            "websocket-not-connected" => SendStatus::WebsocketNotConnected,
            _ => SendStatus::Other(value),
        }
    }
}

impl SendStatus {
    /// The wire string for this status.
    pub fn as_str(&self) -> &str {
        match self {
            SendStatus::Ok => "ok",
            SendStatus::WebsocketNotConnected => "websocket-not-connected",
            SendStatus::Other(other) => other,
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SendStatus> for String {
    fn from(value: SendStatus) -> Self {
        match value {
            SendStatus::Ok => "ok".to_string(),
            SendStatus::WebsocketNotConnected => "websocket-not-connected".to_string(),
            SendStatus::Other(other) => other,
        }
    }
}

/// Body of a successful transaction response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    /// Whether the receiver confirmed delivery synchronously.
    #[serde(rename = "com.beeper.asmux.synchronous", default)]
    pub synchronous: bool,
    /// Delivery status per recipient, present when `synchronous` is true.
    #[serde(
        rename = "com.beeper.asmux.sent_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_to: Option<HashMap<TargetId, SendStatus>>,
}
