//! Upstream `/sync` request filter and response.

use serde::{Deserialize, Serialize};

use crate::{DeviceLists, OtkCount, ToDeviceEvent};

/// A single event-category filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Event types to exclude. `*` excludes everything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_types: Vec<String>,
}

impl EventFilter {
    /// A filter that excludes every event type.
    pub fn nothing() -> Self {
        Self {
            not_types: vec!["*".to_string()],
        }
    }
}

/// Room-scoped filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFilter {
    /// Whether to include rooms the user has left.
    pub include_leave: bool,
    /// Room ephemeral events (typing, receipts).
    pub ephemeral: EventFilter,
    /// Per-room account data.
    pub account_data: EventFilter,
    /// Room state.
    pub state: EventFilter,
    /// Room timeline.
    pub timeline: EventFilter,
}

/// A server-side sync filter definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Presence events.
    pub presence: EventFilter,
    /// Global account data.
    pub account_data: EventFilter,
    /// Room-scoped categories.
    pub room: RoomFilter,
}

impl Filter {
    /// Filter that leaves only the to-device channel (plus the device list
    /// and one-time key metadata, which filters can't suppress).
    pub fn to_device_only() -> Self {
        Self {
            presence: EventFilter::nothing(),
            account_data: EventFilter::nothing(),
            room: RoomFilter {
                include_leave: false,
                ephemeral: EventFilter::nothing(),
                account_data: EventFilter::nothing(),
                state: EventFilter::nothing(),
                timeline: EventFilter::nothing(),
            },
        }
    }
}

/// The `to_device` section of a sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToDevice {
    /// Pending to-device events, in delivery order.
    #[serde(default)]
    pub events: Vec<ToDeviceEvent>,
}

/// The parts of a `/sync` response the relay cares about.
///
/// Everything else in the response (rooms, presence, account data) is
/// filtered out server-side and ignored here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Resume token for the next request.
    pub next_batch: String,
    /// To-device events.
    #[serde(default)]
    pub to_device: ToDevice,
    /// Device list changes since the previous token.
    #[serde(default)]
    pub device_lists: DeviceLists,
    /// Unused one-time key counts for the syncing device.
    #[serde(default)]
    pub device_one_time_keys_count: OtkCount,
}
