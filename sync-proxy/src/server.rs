//! Main SyncProxy coordination.
//!
//! SyncProxy owns the target registry and the collaborators every loop
//! shares, and implements the control-plane start and stop operations.

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::error::{ControlError, ProxyError, StorageError};
use crate::homeserver::Homeserver;
use crate::ids::IdGenerator;
use crate::registry::TargetRegistry;
use crate::sender::TransactionDispatcher;
use crate::storage::TargetStore;
use crate::target::{SyncTarget, TargetUpdate};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncproxy_types::TargetId;
use url::Url;

/// Operational metrics for monitoring proxy activity.
///
/// Counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Successful long-polls.
    pub syncs: AtomicU64,
    /// Long-polls that failed and were retried.
    pub sync_errors: AtomicU64,
    /// Loops that ended with an error worth reporting.
    pub sync_failures: AtomicU64,
    /// Transactions delivered.
    pub transactions_sent: AtomicU64,
    /// Error notifications delivered.
    pub error_notifications_sent: AtomicU64,
    /// Delivery attempts that were retried.
    pub delivery_retries: AtomicU64,
    /// Deliveries abandoned without success.
    pub deliveries_failed: AtomicU64,
    /// Loops executing right now.
    pub running_loops: AtomicU64,
}

/// Everything a sync loop needs besides its own target.
pub struct ProxyContext {
    /// Durable target storage.
    pub store: Arc<dyn TargetStore>,
    /// Upstream homeserver.
    pub homeserver: Arc<dyn Homeserver>,
    /// Downstream sender.
    pub dispatcher: TransactionDispatcher,
    /// Shared ID counters.
    pub ids: Arc<IdGenerator>,
    /// Shared metrics.
    pub metrics: Arc<ProxyMetrics>,
    /// Long-poll budget.
    pub sync_timeout: Duration,
    /// Backoff for failed long-polls.
    pub retry: RetryPolicy,
}

impl ProxyContext {
    /// Build the shared context from configuration.
    pub fn new(
        config: &Config,
        store: Arc<dyn TargetStore>,
        homeserver: Arc<dyn Homeserver>,
    ) -> Result<Self, ProxyError> {
        let ids = Arc::new(IdGenerator::new());
        let metrics = Arc::new(ProxyMetrics::default());
        let retry = RetryPolicy::from(config.retry);
        let dispatcher =
            TransactionDispatcher::new(&config.delivery, retry, ids.clone(), metrics.clone())
                .map_err(ProxyError::HttpClient)?;
        Ok(Self {
            store,
            homeserver,
            dispatcher,
            ids,
            metrics,
            sync_timeout: config.sync.timeout(),
            retry,
        })
    }
}

/// Check that an address can be used as a delivery base URL.
pub fn validate_address(address: &str) -> Result<Url, ControlError> {
    let url = Url::parse(address).map_err(|e| ControlError::InvalidAddress(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ControlError::InvalidAddress(format!(
            "unsupported scheme '{other}'"
        ))),
    }
}

/// Main proxy server.
pub struct SyncProxy {
    config: Config,
    ctx: Arc<ProxyContext>,
    registry: TargetRegistry,
    started_at: Instant,
}

impl std::fmt::Debug for SyncProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProxy")
            .field("config", &self.config)
            .field("targets", &self.registry.len())
            .field("metrics", &self.ctx.metrics)
            .finish_non_exhaustive()
    }
}

impl SyncProxy {
    /// Create a proxy with an empty registry.
    pub fn new(
        config: Config,
        store: Arc<dyn TargetStore>,
        homeserver: Arc<dyn Homeserver>,
    ) -> Result<Self, ProxyError> {
        let ctx = Arc::new(ProxyContext::new(&config, store, homeserver)?);
        Ok(Self {
            config,
            ctx,
            registry: TargetRegistry::new(),
            started_at: Instant::now(),
        })
    }

    /// Get the proxy configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared context handed to every target.
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Get the target registry.
    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.ctx.metrics
    }

    /// Time since the proxy was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Load every stored target into the registry.
    ///
    /// Records with an unusable address are logged and skipped. Returns the
    /// number loaded.
    pub async fn load_targets(&self) -> Result<usize, StorageError> {
        let records = self.ctx.store.load_all().await?;
        let mut loaded = 0;
        for record in records {
            if let Err(err) = validate_address(&record.address) {
                tracing::warn!(
                    "Failed to initialize target {} (startup): {}",
                    record.id,
                    err
                );
                continue;
            }
            let id = record.id.clone();
            let target = Arc::new(SyncTarget::from_store(record, self.ctx.clone()));
            self.registry.get_or_create(id, target);
            loaded += 1;
        }
        tracing::info!("Loaded {} targets from database", loaded);
        Ok(loaded)
    }

    /// Spawn a loop for every target persisted as active. Returns how many.
    pub fn start_active_targets(&self) -> usize {
        let mut started = 0;
        for target in self.registry.all() {
            if target.is_active() {
                tracing::debug!("Resuming syncing for {}", target.id());
                tokio::spawn(target.start());
                started += 1;
            }
        }
        started
    }

    /// Create or update a target and (re)start its loop.
    pub async fn put_target(&self, id: TargetId, update: TargetUpdate) -> Result<(), ControlError> {
        validate_address(&update.address)?;

        let candidate = Arc::new(SyncTarget::new(
            update.clone().into_record(id.clone()),
            self.ctx.clone(),
        ));
        let (target, _) = self.registry.get_or_create(id, candidate);

        // A failed upsert leaves the target unsaved, so a retry writes again.
        if let Some(record) = target.update(&update) {
            tracing::debug!("Upserting target {} for PUT request", target.id());
            self.ctx.store.upsert(&record).await.map_err(|err| {
                tracing::warn!("Failed to upsert target {}: {}", target.id(), err);
                ControlError::UpsertFailed(err)
            })?;
            target.mark_saved(&record);
        }

        tracing::debug!("Starting target {} for PUT request", target.id());
        tokio::spawn(target.start());
        Ok(())
    }

    /// Stop a target's loop and wait for it to finish.
    ///
    /// The wait is bounded by `sync.stop_timeout_secs`.
    pub async fn stop_target(&self, id: &TargetId) -> Result<(), ControlError> {
        let Some(target) = self.registry.get(id) else {
            tracing::debug!("Client requested stopping unknown appservice {}", id);
            return Err(ControlError::NotFound);
        };
        if !target.is_active() {
            tracing::debug!("Client requested stopping inactive appservice {}", id);
            return Err(ControlError::NotActive);
        }

        target.stop();
        tracing::debug!("Waiting for syncing of {} to stop", id);
        tokio::time::timeout(self.config.sync.stop_timeout(), target.wait_stopped())
            .await
            .map_err(|_| {
                tracing::warn!("Syncing of {} did not stop in time", id);
                ControlError::StopTimeout
            })?;
        tracing::info!("Target {} stopped after DELETE request", id);
        Ok(())
    }
}
