//! Per-target lifecycle.
//!
//! A [`SyncTarget`] owns at most one running sync loop. `start` cancels and
//! joins any previous loop before beginning a new one; `stop` only signals.
//! Every exit path clears the active flag and the cancellation handle.

use crate::error::SyncError;
use crate::homeserver::Credentials;
use crate::sender::{Destination, Payload};
use crate::server::ProxyContext;
use crate::storage::TargetRecord;
use crate::syncer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syncproxy_types::{DeviceId, ErrorRequest, TargetId, UserId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Fields a control-plane `PUT` may set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetUpdate {
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
    /// Whether `address` is another relay.
    pub is_proxy: bool,
}

impl TargetUpdate {
    /// A fresh record for a target that has never synced.
    pub fn into_record(self, id: TargetId) -> TargetRecord {
        TargetRecord {
            id,
            bot_access_token: self.bot_access_token,
            hs_token: self.hs_token,
            address: self.address,
            user_id: self.user_id,
            device_id: self.device_id,
            is_proxy: self.is_proxy,
            next_batch: String::new(),
            active: false,
        }
    }

    fn fields(&self) -> ControlFields<'_> {
        (
            self.bot_access_token.as_str(),
            self.hs_token.as_str(),
            self.address.as_str(),
            &self.user_id,
            &self.device_id,
            self.is_proxy,
        )
    }
}

type ControlFields<'a> = (&'a str, &'a str, &'a str, &'a UserId, &'a DeviceId, bool);

fn control_fields(record: &TargetRecord) -> ControlFields<'_> {
    (
        record.bot_access_token.as_str(),
        record.hs_token.as_str(),
        record.address.as_str(),
        &record.user_id,
        &record.device_id,
        record.is_proxy,
    )
}

struct RunHandle {
    session: u64,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One bridged account and its sync loop.
pub struct SyncTarget {
    id: TargetId,
    ctx: Arc<ProxyContext>,
    state: Mutex<TargetRecord>,
    /// Whether the control fields in `state` are known to be in the store.
    /// Only touched while `state` is locked.
    saved: AtomicBool,
    /// Held for the whole lifetime of a loop; serializes starts.
    run_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<RunHandle>>,
    running: watch::Sender<bool>,
}

impl std::fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTarget")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncTarget {
    /// Wrap a record that hasn't been persisted yet. No loop is started.
    pub fn new(record: TargetRecord, ctx: Arc<ProxyContext>) -> Self {
        Self::with_saved(record, ctx, false)
    }

    /// Wrap a record that was just read from the store.
    pub fn from_store(record: TargetRecord, ctx: Arc<ProxyContext>) -> Self {
        Self::with_saved(record, ctx, true)
    }

    fn with_saved(record: TargetRecord, ctx: Arc<ProxyContext>, saved: bool) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            id: record.id.clone(),
            ctx,
            state: Mutex::new(record),
            saved: AtomicBool::new(saved),
            run_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            running,
        }
    }

    /// Target ID.
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub(crate) fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Copy of the current record.
    pub fn record(&self) -> TargetRecord {
        lock(&self.state).clone()
    }

    /// Whether the target is marked active.
    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    /// Whether a loop is executing right now.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Current resume token.
    pub fn next_batch(&self) -> String {
        lock(&self.state).next_batch.clone()
    }

    pub(crate) fn credentials(&self) -> Credentials {
        let state = lock(&self.state);
        Credentials {
            user_id: state.user_id.clone(),
            access_token: state.bot_access_token.clone(),
        }
    }

    pub(crate) fn destination(&self) -> Destination {
        let state = lock(&self.state);
        Destination {
            id: self.id.clone(),
            address: state.address.clone(),
            hs_token: state.hs_token.clone(),
            is_proxy: state.is_proxy,
        }
    }

    /// Apply control-plane fields. Returns the record to persist, or `None`
    /// if the store already holds exactly these fields.
    ///
    /// Call [`mark_saved`] once the returned record is written.
    ///
    /// [`mark_saved`]: SyncTarget::mark_saved
    pub fn update(&self, update: &TargetUpdate) -> Option<TargetRecord> {
        let mut state = lock(&self.state);
        if control_fields(&state) == update.fields() {
            if self.saved.load(Ordering::Acquire) {
                return None;
            }
        } else {
            state.bot_access_token = update.bot_access_token.clone();
            state.hs_token = update.hs_token.clone();
            state.address = update.address.clone();
            state.user_id = update.user_id.clone();
            state.device_id = update.device_id.clone();
            state.is_proxy = update.is_proxy;
            self.saved.store(false, Ordering::Release);
        }
        Some(state.clone())
    }

    /// Note that `record` reached the store. Ignored if the fields changed
    /// again in the meantime.
    pub fn mark_saved(&self, record: &TargetRecord) {
        let state = lock(&self.state);
        if control_fields(&state) == control_fields(record) {
            self.saved.store(true, Ordering::Release);
        }
    }

    async fn set_active(&self, active: bool) {
        {
            let mut state = lock(&self.state);
            if state.active == active {
                return;
            }
            state.active = active;
        }
        if let Err(err) = self.ctx.store.set_active(&self.id, active).await {
            let what = if active { "active" } else { "inactive" };
            tracing::warn!("Failed to mark target as {}: {}", what, err);
        }
    }

    /// Record a new resume token. Persistence failures are logged only.
    pub(crate) async fn set_next_batch(&self, next_batch: &str) {
        {
            let mut state = lock(&self.state);
            if state.next_batch == next_batch {
                return;
            }
            state.next_batch = next_batch.to_string();
        }
        if let Err(err) = self.ctx.store.set_next_batch(&self.id, next_batch).await {
            tracing::warn!("Failed to store next batch in database: {}", err);
        }
    }

    /// Run a sync loop until it is stopped or fails.
    ///
    /// A loop that is already running is cancelled and joined first. If
    /// another `start` or a `stop` arrives while this one is still waiting
    /// for the previous loop, this call returns without syncing.
    pub async fn start(self: Arc<Self>) {
        let session = self.ctx.ids.next_sync_session();
        let span = tracing::info_span!("sync", appservice_id = %self.id, session);
        self.run(session).instrument(span).await
    }

    async fn run(self: Arc<Self>, session: u64) {
        let cancel = CancellationToken::new();
        let previous = lock(&self.current).replace(RunHandle {
            session,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::debug!("There seems to be an existing syncer running, stopping it first");
            previous.cancel.cancel();
        }

        tracing::debug!("Waiting for previous syncer to finish");
        let _guard = self.run_lock.lock().await;
        if cancel.is_cancelled() {
            tracing::debug!("Start was superseded before syncing began");
            self.clear_handle(session);
            return;
        }

        self.running.send_replace(true);
        self.ctx.metrics.running_loops.fetch_add(1, Ordering::Relaxed);
        self.set_active(true).await;

        tracing::info!("Starting syncing");
        let task = tokio::spawn(syncer::run(self.clone(), cancel.clone()).in_current_span());
        match task.await {
            Ok(reason) if reason.is_clean() => tracing::info!("Syncing stopped: {}", reason),
            Ok(reason) => {
                tracing::error!("Syncing failed: {}, notifying target...", reason);
                self.notify_failure(&reason, &cancel).await;
            }
            Err(err) if err.is_panic() => tracing::error!("Syncing panicked: {}", err),
            Err(err) => tracing::error!("Sync task ended abnormally: {}", err),
        }

        self.set_active(false).await;
        self.clear_handle(session);
        self.ctx.metrics.running_loops.fetch_sub(1, Ordering::Relaxed);
        self.running.send_replace(false);
    }

    fn clear_handle(&self, session: u64) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|h| h.session == session) {
            *current = None;
        }
    }

    async fn notify_failure(&self, reason: &SyncError, cancel: &CancellationToken) {
        self.ctx.metrics.sync_failures.fetch_add(1, Ordering::Relaxed);
        let notice = ErrorRequest::new(reason.proxy_error_code(), reason.to_string());
        let dest = self.destination();
        if let Err(err) = self
            .ctx
            .dispatcher
            .send(&dest, Payload::Error(&notice), cancel)
            .await
        {
            tracing::warn!("Failed to notify target about sync error: {}", err);
        }
    }

    /// Ask the current loop to stop. Doesn't wait; see [`wait_stopped`].
    ///
    /// [`wait_stopped`]: SyncTarget::wait_stopped
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.current).as_ref() {
            tracing::debug!(appservice_id = %self.id, "Stopping syncing...");
            handle.cancel.cancel();
        }
    }

    /// Resolve once no loop is executing.
    pub async fn wait_stopped(&self) {
        let mut running = self.running.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = running.wait_for(|running| !*running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HomeserverError;
    use crate::storage::TargetStore;
    use crate::test_support::{response, TestProxy};
    use serde_json::json;
    use std::time::Duration;
    use syncproxy_types::MatrixError;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, ResponseTemplate};

    #[tokio::test]
    async fn update_reports_changes_only() {
        let proxy = TestProxy::new().await;
        let record = proxy.update();
        let target = SyncTarget::from_store(
            record.clone().into_record("T1".into()),
            proxy.proxy.context().clone(),
        );

        assert!(target.update(&record).is_none());

        let mut proxied = record.clone();
        proxied.is_proxy = true;
        let updated = target.update(&proxied).unwrap();
        assert!(updated.is_proxy);
        // Still unsaved, so the same fields must be written again.
        assert_eq!(target.update(&proxied), Some(updated.clone()));

        target.mark_saved(&updated);
        assert!(target.update(&proxied).is_none());
    }

    #[tokio::test]
    async fn new_target_needs_saving_until_marked() {
        let proxy = TestProxy::new().await;
        let update = proxy.update();
        let target = proxy.detached_target("T1");

        let pending = target.update(&update).unwrap();
        assert_eq!(pending, target.record());

        // A save that lost a race with a newer update doesn't count.
        let mut stale = pending.clone();
        stale.hs_token = "old".to_string();
        target.mark_saved(&stale);
        assert!(target.update(&update).is_some());

        target.mark_saved(&pending);
        assert!(target.update(&update).is_none());
    }

    #[tokio::test]
    async fn start_marks_active_and_stop_clears_it() {
        let proxy = TestProxy::new().await;
        let target = proxy.add_target("T1").await;

        let handle = tokio::spawn(target.clone().start());
        proxy.homeserver.wait_for_syncs(1).await;
        assert!(target.is_running());
        assert!(target.is_active());
        assert!(proxy.store.load_all().await.unwrap()[0].active);

        target.stop();
        tokio::time::timeout(Duration::from_secs(5), target.wait_stopped())
            .await
            .unwrap();
        handle.await.unwrap();

        assert!(!target.is_running());
        assert!(!target.is_active());
        assert!(!proxy.store.load_all().await.unwrap()[0].active);
        assert!(proxy.downstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let proxy = TestProxy::new().await;
        let target = proxy.add_target("T1").await;
        target.stop();
        target.stop();

        let handle = tokio::spawn(target.clone().start());
        proxy.homeserver.wait_for_syncs(1).await;
        target.stop();
        target.stop();
        handle.await.unwrap();
        target.stop();
        assert!(!target.is_running());
    }

    #[tokio::test]
    async fn restart_never_overlaps_loops() {
        let proxy = TestProxy::new().await;
        let target = proxy.add_target("T1").await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(tokio::spawn(target.clone().start()));
            tokio::task::yield_now().await;
        }
        // Every superseded start returns; only the newest keeps syncing.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let finished = handles.iter().filter(|h| h.is_finished()).count();
                if finished == handles.len() - 1 && target.is_running() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("exactly one loop should remain");
        assert_eq!(proxy.metrics().running_loops.load(Ordering::Relaxed), 1);

        target.stop();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!target.is_running());
        assert_eq!(proxy.metrics().running_loops.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn fatal_error_sends_logged_out_notification() {
        let proxy = TestProxy::new().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/_matrix/app/unstable/fi\.mau\.syncproxy/error/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&proxy.downstream)
            .await;
        proxy.homeserver.push_sync(Err(HomeserverError::UnknownToken(MatrixError::new(
            "M_UNKNOWN_TOKEN",
            "Invalid access token",
        ))));
        let target = proxy.add_target("T1").await;

        tokio::time::timeout(Duration::from_secs(5), target.clone().start())
            .await
            .unwrap();

        let requests = proxy.downstream.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["errcode"], "FI.MAU.CLIENT_LOGGED_OUT");
        assert!(!target.is_active());
        assert!(!proxy.store.load_all().await.unwrap()[0].active);
    }

    #[tokio::test]
    async fn failed_notification_is_not_fatal() {
        let proxy = TestProxy::new().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "errcode": "FI.MAU.WS_NOT_CONNECTED",
                "error": "no websocket"
            })))
            .mount(&proxy.downstream)
            .await;
        proxy.homeserver.push_sync(Err(HomeserverError::UnknownToken(MatrixError::new(
            "M_UNKNOWN_TOKEN",
            "Invalid access token",
        ))));
        let target = proxy.add_target("T1").await;

        tokio::time::timeout(Duration::from_secs(5), target.clone().start())
            .await
            .unwrap();
        assert!(!target.is_running());
        assert!(!target.is_active());
    }

    #[tokio::test]
    async fn panicking_loop_is_cleaned_up() {
        let proxy = TestProxy::new().await;
        proxy.homeserver.panic_on_next_sync();
        let target = proxy.add_target("T1").await;

        tokio::time::timeout(Duration::from_secs(5), target.clone().start())
            .await
            .unwrap();

        assert_eq!(proxy.homeserver.since_log(), vec![""]);
        assert!(!target.is_running());
        assert!(!target.is_active());
        assert!(!proxy.store.load_all().await.unwrap()[0].active);
        assert_eq!(proxy.metrics().running_loops.load(Ordering::Relaxed), 0);
        assert!(proxy.downstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_write_failures_dont_stop_syncing() {
        let proxy = TestProxy::new().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&proxy.downstream)
            .await;
        proxy.homeserver.push_sync(Ok(response("tok1", 1, 5)));
        proxy.homeserver.push_sync(Ok(response("tok2", 1, 5)));
        let target = proxy.add_target("T1").await;
        proxy.faults.fail_writes.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(target.clone().start());
        proxy.homeserver.wait_for_syncs(3).await;

        assert_eq!(proxy.homeserver.since_log(), vec!["", "tok1", "tok2"]);
        assert_eq!(target.next_batch(), "tok2");
        assert!(target.is_active());
        assert!(target.is_running());
        let stored = proxy.store.load_all().await.unwrap();
        assert_eq!(stored[0].next_batch, "");
        assert!(!stored[0].active);

        target.stop();
        handle.await.unwrap();
        assert!(!target.is_active());
    }

    #[tokio::test]
    async fn resume_token_survives_reload() {
        let proxy = TestProxy::new().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&proxy.downstream)
            .await;
        proxy.homeserver.push_sync(Ok(response("tok1", 0, 5)));
        proxy.homeserver.push_sync(Ok(response("tok2", 1, 5)));
        let target = proxy.add_target("T1").await;

        let handle = tokio::spawn(target.clone().start());
        proxy.homeserver.wait_for_syncs(3).await;
        target.stop();
        handle.await.unwrap();

        let reloaded = proxy.store.load_all().await.unwrap();
        assert_eq!(reloaded[0].next_batch, "tok2");
        assert_eq!(proxy.homeserver.since_log(), vec!["", "tok1", "tok2"]);
    }
}
