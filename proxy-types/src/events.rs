//! The encryption-bootstrap parts of a sync response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::{DeviceId, UserId};

/// A to-device event.
///
/// The relay never looks inside `content`. Unknown top-level fields are kept
/// so that forwarding is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// Event type, e.g. `m.room.encrypted`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sending user.
    #[serde(default)]
    pub sender: UserId,
    /// Opaque event content.
    #[serde(default)]
    pub content: Value,
    /// Recipient user, stamped by the relay before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    /// Recipient device, stamped by the relay before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_device_id: Option<DeviceId>,
    /// Any other fields the homeserver sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToDeviceEvent {
    /// Stamp the event with the device it was synced for.
    pub fn stamp(&mut self, user_id: &UserId, device_id: &DeviceId) {
        self.to_user_id = Some(user_id.clone());
        self.to_device_id = Some(device_id.clone());
    }
}

/// Users whose device lists changed, or who no longer share a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users whose devices changed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<UserId>,
    /// Users we no longer share an encrypted room with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub left: Vec<UserId>,
}

impl DeviceLists {
    /// Whether both sets are empty.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}

/// Unused one-time key counts, keyed by algorithm.
///
/// Only compared for equality; the relay does not act on the numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OtkCount(BTreeMap<String, u64>);

impl OtkCount {
    /// Build a count from `(algorithm, count)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(algorithm, count)| (algorithm.to_string(), count))
                .collect(),
        )
    }

    /// Number of algorithms with a count.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no algorithm has a count.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
