//! The per-target long-poll loop.

use crate::error::{HomeserverError, SyncError};
use crate::homeserver::{Credentials, SyncRequest};
use crate::sender::Payload;
use crate::server::ProxyContext;
use crate::target::SyncTarget;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use syncproxy_types::{DeviceId, Filter, OtkCount, SyncResponse, Transaction, UserId};
use tokio_util::sync::CancellationToken;

/// Decides what part of a sync response is worth a transaction.
///
/// One-time key counts go out on the first response of a loop and then only
/// when they change.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    prev_otk_count: OtkCount,
    otk_count_sent: bool,
}

impl DeltaTracker {
    /// Build the transaction for `resp`, or `None` if there's nothing new.
    pub fn build(
        &mut self,
        resp: SyncResponse,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<Transaction> {
        let send_otk = !self.otk_count_sent || resp.device_one_time_keys_count != self.prev_otk_count;
        let has_device_lists = !resp.device_lists.is_empty();

        let mut ephemeral = resp.to_device.events;
        for event in &mut ephemeral {
            event.stamp(user_id, device_id);
        }
        let device_one_time_keys_count = send_otk.then(|| {
            BTreeMap::from([(user_id.clone(), resp.device_one_time_keys_count.clone())])
        });
        self.prev_otk_count = resp.device_one_time_keys_count;
        self.otk_count_sent = true;

        let txn = Transaction {
            ephemeral,
            device_lists: has_device_lists.then_some(resp.device_lists),
            device_one_time_keys_count,
        };
        (!txn.is_empty()).then_some(txn)
    }
}

/// Sync until cancelled or something fatal happens, and say why it stopped.
pub async fn run(target: Arc<SyncTarget>, cancel: CancellationToken) -> SyncError {
    let ctx = target.context();
    let credentials = target.credentials();
    let device_id = target.record().device_id;

    let filter_id = match create_filter(ctx, &credentials, &cancel).await {
        Ok(filter_id) => filter_id,
        Err(reason) => return reason,
    };

    let mut tracker = DeltaTracker::default();
    let mut backoff = ctx.retry.backoff();
    loop {
        let since = target.next_batch();
        let request = SyncRequest {
            since: &since,
            filter_id: &filter_id,
            timeout: ctx.sync_timeout,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SyncError::Cancelled,
            result = ctx.homeserver.sync(&credentials, request) => result,
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(HomeserverError::UnknownToken(err)) => return SyncError::UnknownToken(err),
            Err(err) => {
                ctx.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Error syncing: {}. Retrying in {:?}", err, backoff.current());
                if !backoff.wait(&cancel).await {
                    tracing::debug!("Cancelled while waiting to retry sync");
                    return SyncError::Cancelled;
                }
                continue;
            }
        };
        backoff.reset();
        ctx.metrics.syncs.fetch_add(1, Ordering::Relaxed);

        let next_batch = resp.next_batch.clone();
        if let Some(txn) = tracker.build(resp, &credentials.user_id, &device_id) {
            let dest = target.destination();
            if let Err(err) = ctx
                .dispatcher
                .send(&dest, Payload::Transaction(&txn), &cancel)
                .await
            {
                return err.into();
            }
        }
        tracing::debug!("Storing new next batch token: {}", next_batch);
        target.set_next_batch(&next_batch).await;
    }
}

async fn create_filter(
    ctx: &ProxyContext,
    credentials: &Credentials,
    cancel: &CancellationToken,
) -> Result<String, SyncError> {
    let filter = Filter::to_device_only();
    let mut backoff = ctx.retry.backoff();
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = ctx.homeserver.create_filter(credentials, &filter) => result,
        };
        match result {
            Ok(filter_id) => return Ok(filter_id),
            Err(HomeserverError::UnknownToken(err)) => return Err(SyncError::UnknownToken(err)),
            Err(err) => {
                tracing::warn!(
                    "Failed to create filter: {}. Retrying in {:?}",
                    err,
                    backoff.current()
                );
                if !backoff.wait(cancel).await {
                    return Err(SyncError::Cancelled);
                }
            }
        }
    }
}
