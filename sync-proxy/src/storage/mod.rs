//! Storage layer for syncproxy.
//!
//! Durable target records: credentials, downstream address, resume token and
//! the active flag that lets a restarted process resume its loops.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use syncproxy_types::{DeviceId, TargetId, UserId};

/// A persisted sync target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRecord {
    /// Appservice ID, unique per target.
    pub id: TargetId,
    /// Access token used against the upstream homeserver.
    pub bot_access_token: String,
    /// Token presented to the downstream receiver.
    pub hs_token: String,
    /// Base URL transactions are delivered to.
    pub address: String,
    /// User the bot syncs as.
    pub user_id: UserId,
    /// Device the bot syncs as.
    pub device_id: DeviceId,
    /// Whether `address` is another syncproxy-aware relay.
    pub is_proxy: bool,
    /// Resume token; empty until the first successful sync.
    pub next_batch: String,
    /// Whether a loop was running when last persisted.
    pub active: bool,
}

/// Trait for target storage backends.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert a target, or update its credentials, address, identity and
    /// proxy flag. Never touches `next_batch` or `active`.
    async fn upsert(&self, target: &TargetRecord) -> Result<(), StorageError>;

    /// Persist whether a loop is running for the target.
    async fn set_active(&self, id: &TargetId, active: bool) -> Result<(), StorageError>;

    /// Persist the resume token for the target.
    async fn set_next_batch(&self, id: &TargetId, next_batch: &str) -> Result<(), StorageError>;

    /// Load every stored target.
    async fn load_all(&self) -> Result<Vec<TargetRecord>, StorageError>;
}
