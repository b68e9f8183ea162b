//! Shared fixtures for unit tests.

use crate::config::{Config, RetryConfig};
use crate::error::StorageError;
use crate::homeserver::mock::MockHomeserver;
use crate::server::{ProxyMetrics, SyncProxy};
use crate::storage::{SqliteStore, TargetRecord, TargetStore};
use crate::target::{SyncTarget, TargetUpdate};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use syncproxy_types::{
    DeviceId, OtkCount, SyncResponse, TargetId, ToDevice, ToDeviceEvent, UserId,
};
use wiremock::MockServer;

pub const SHARED_SECRET: &str = "secret";

/// Wraps the SQLite store and fails writes on demand.
pub struct FaultyStore {
    inner: Arc<SqliteStore>,
    /// Number of upcoming upserts to reject.
    pub upsert_failures: AtomicUsize,
    /// Reject every `set_active` and `set_next_batch`.
    pub fail_writes: AtomicBool,
}

impl FaultyStore {
    fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            upsert_failures: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn disk_full() -> StorageError {
        StorageError::Database(sqlx::Error::Protocol("disk full".into()))
    }

    fn check_writes(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::disk_full());
        }
        Ok(())
    }
}

#[async_trait]
impl TargetStore for FaultyStore {
    async fn upsert(&self, target: &TargetRecord) -> Result<(), StorageError> {
        let failing = self
            .upsert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::disk_full());
        }
        self.inner.upsert(target).await
    }

    async fn set_active(&self, id: &TargetId, active: bool) -> Result<(), StorageError> {
        self.check_writes()?;
        self.inner.set_active(id, active).await
    }

    async fn set_next_batch(&self, id: &TargetId, next_batch: &str) -> Result<(), StorageError> {
        self.check_writes()?;
        self.inner.set_next_batch(id, next_batch).await
    }

    async fn load_all(&self) -> Result<Vec<TargetRecord>, StorageError> {
        self.inner.load_all().await
    }
}

/// A proxy wired to an in-memory store, a scripted homeserver and a
/// wiremock receiver.
pub struct TestProxy {
    pub proxy: Arc<SyncProxy>,
    /// What actually got persisted.
    pub store: Arc<SqliteStore>,
    /// The store the proxy writes through.
    pub faults: Arc<FaultyStore>,
    pub homeserver: Arc<MockHomeserver>,
    pub downstream: MockServer,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.homeserver.url = "https://matrix.example.com".to_string();
    config.server.shared_secret = SHARED_SECRET.to_string();
    config.sync.stop_timeout_secs = 5;
    config.delivery.request_timeout_secs = 5;
    config.retry = RetryConfig {
        initial_ms: 1,
        max_ms: 4,
    };
    config
}

impl TestProxy {
    pub async fn new() -> Self {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let homeserver = Arc::new(MockHomeserver::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let downstream = MockServer::start().await;
        let proxy = SyncProxy::new(test_config(), faults.clone(), homeserver.clone()).unwrap();
        Self {
            proxy: Arc::new(proxy),
            store,
            faults,
            homeserver,
            downstream,
        }
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        self.proxy.metrics()
    }

    /// Control-plane fields for `id`, pointing at the wiremock receiver.
    pub fn update_for(&self, id: &str) -> TargetUpdate {
        TargetUpdate {
            bot_access_token: format!("syt_{id}"),
            hs_token: format!("hs_{id}"),
            address: self.downstream.uri(),
            user_id: UserId::new(format!("@{id}bot:example.com")),
            device_id: DeviceId::new("BOTDEVICE"),
            is_proxy: false,
        }
    }

    pub fn update(&self) -> TargetUpdate {
        self.update_for("T1")
    }

    /// Persist an inactive target and register it with the proxy.
    pub async fn add_target(&self, id: &str) -> Arc<SyncTarget> {
        let record = self.update_for(id).into_record(TargetId::new(id));
        self.store.upsert(&record).await.unwrap();
        let (target, _) = self
            .proxy
            .registry()
            .get_or_create(
                record.id.clone(),
                Arc::new(SyncTarget::from_store(record, self.proxy.context().clone())),
            );
        target
    }

    /// A target that is neither stored nor registered.
    pub fn detached_target(&self, id: &str) -> Arc<SyncTarget> {
        let record = self.update_for(id).into_record(TargetId::new(id));
        Arc::new(SyncTarget::new(record, self.proxy.context().clone()))
    }
}

/// A sync response with `events` encrypted to-device events and the given
/// signed curve25519 key count.
pub fn response(next_batch: &str, events: usize, otk: u64) -> SyncResponse {
    let events = (0..events)
        .map(|i| {
            serde_json::from_value::<ToDeviceEvent>(json!({
                "type": "m.room.encrypted",
                "sender": "@alice:example.com",
                "content": {
                    "algorithm": "m.olm.v1.curve25519-aes-sha2",
                    "ciphertext": { "key": { "type": 0, "body": format!("ct{i}") } },
                },
            }))
            .unwrap()
        })
        .collect();
    SyncResponse {
        next_batch: next_batch.to_string(),
        to_device: ToDevice { events },
        device_one_time_keys_count: OtkCount::from_pairs([("signed_curve25519", otk)]),
        ..Default::default()
    }
}
