//! Downstream delivery of transactions and error notifications.
//!
//! Each send gets one wrapped transaction ID and is retried with exponential
//! backoff until it succeeds, fails in a way retrying can't fix, or the loop
//! is cancelled.

use crate::backoff::RetryPolicy;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::ids::{IdGenerator, TxnKind};
use crate::server::ProxyMetrics;
use reqwest::header::CONTENT_TYPE;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use syncproxy_types::{
    errcode, ErrorRequest, MatrixError, SendStatus, TargetId, Transaction, TransactionRequest,
    TransactionResponse,
};
use tokio_util::sync::CancellationToken;
use url::Url;

const TRANSACTION_PATH: &str = "/_matrix/app/v1/transactions";
const ERROR_PATH: &str = "/_matrix/app/unstable/fi.mau.syncproxy/error";

/// Where and how to deliver for one target.
///
/// A snapshot taken at send time, so later control-plane updates don't
/// change a send that is already retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target ID, sent as `appservice_id` and used to find our entry in a
    /// synchronous confirmation.
    pub id: TargetId,
    /// Base URL of the receiver.
    pub address: String,
    /// Bearer token for the receiver.
    pub hs_token: String,
    /// Whether the receiver is itself a relay.
    pub is_proxy: bool,
}

/// What to deliver.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// A normal transaction.
    Transaction(&'a Transaction),
    /// A failure notification.
    Error(&'a ErrorRequest),
}

impl Payload<'_> {
    fn kind(&self) -> TxnKind {
        match self {
            Payload::Transaction(_) => TxnKind::Transaction,
            Payload::Error(_) => TxnKind::Error,
        }
    }

    fn encode(&self, txn_id: &str, target: &TargetId) -> Result<Vec<u8>, DeliveryError> {
        let body = match self {
            Payload::Transaction(txn) => {
                serde_json::to_vec(&TransactionRequest::new(txn, txn_id, target))?
            }
            Payload::Error(error) => serde_json::to_vec(&ErrorRequest {
                wrapped_txn_id: txn_id.to_string(),
                ..(*error).clone()
            })?,
        };
        Ok(body)
    }
}

/// Build the delivery URL for a path ID.
///
/// Any path on `address` is replaced; its query string is kept.
pub fn transaction_url(
    address: &str,
    target: &TargetId,
    path_txn_id: &str,
    kind: TxnKind,
) -> Result<Url, DeliveryError> {
    let mut url = Url::parse(address)?;
    let prefix = match kind {
        TxnKind::Transaction => TRANSACTION_PATH,
        TxnKind::Error => ERROR_PATH,
    };
    url.set_path(&format!("{prefix}/{path_txn_id}"));
    url.query_pairs_mut()
        .append_pair("appservice_id", target.as_str());
    Ok(url)
}

/// Decide whether a decoded 2xx response counts as delivered.
pub fn check_response(
    response: TransactionResponse,
    target: &TargetId,
    status: u16,
    expect_synchronous: bool,
) -> Result<(), DeliveryError> {
    if !response.synchronous {
        return if expect_synchronous {
            Err(DeliveryError::SynchronousNotSupported { status })
        } else {
            Ok(())
        };
    }
    let sent_to = response
        .sent_to
        .ok_or(DeliveryError::MissingSentTo { status })?;
    match sent_to.get(target) {
        Some(SendStatus::Ok) => Ok(()),
        Some(SendStatus::WebsocketNotConnected) => Err(DeliveryError::WebsocketNotConnected),
        Some(other) => Err(DeliveryError::NotDelivered {
            status,
            send_status: other.clone(),
        }),
        None => Err(DeliveryError::NotConfirmed { status }),
    }
}

/// HTTP sender with retry, shared by every target.
pub struct TransactionDispatcher {
    http: reqwest::Client,
    ids: Arc<IdGenerator>,
    metrics: Arc<ProxyMetrics>,
    expect_synchronous: bool,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TransactionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionDispatcher")
            .field("expect_synchronous", &self.expect_synchronous)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TransactionDispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: &DeliveryConfig,
        retry: RetryPolicy,
        ids: Arc<IdGenerator>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("syncproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            ids,
            metrics,
            expect_synchronous: config.expect_synchronous,
            retry,
        })
    }

    /// Deliver one payload, retrying until it lands, a non-retryable error
    /// occurs, or `cancel` fires.
    pub async fn send(
        &self,
        dest: &Destination,
        payload: Payload<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        if dest.hs_token.is_empty() {
            return Err(DeliveryError::MissingHsToken);
        }

        let kind = payload.kind();
        let txn_id = self.ids.next_txn_id(kind);
        match payload {
            Payload::Transaction(txn) => tracing::debug!(
                txn = txn_id.counter,
                "Sending {} to-device events, {} device list changes and {} OTK counts to {} in transaction {}",
                txn.ephemeral.len(),
                txn.device_list_changes(),
                txn.device_one_time_keys_count.as_ref().map_or(0, |c| c.len()),
                dest.id,
                txn_id.id
            ),
            Payload::Error(error) => tracing::debug!(
                txn = txn_id.counter,
                "Sending error '{}' to {} in transaction {}",
                error.code.as_str(),
                dest.id,
                txn_id.id
            ),
        }
        let body = payload.encode(&txn_id.id, &dest.id)?;

        let mut backoff = self.retry.backoff();
        let mut attempt_no = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }
            let result = tokio::select! {
                result = self.attempt(dest, kind, &txn_id.id, &body, attempt_no) => result,
                _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
            };

            match result {
                Ok(()) => {
                    let counter = match kind {
                        TxnKind::Transaction => &self.metrics.transactions_sent,
                        TxnKind::Error => &self.metrics.error_notifications_sent,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => {
                    if !matches!(err, DeliveryError::Cancelled) {
                        self.metrics.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        txn = txn_id.counter,
                        "Failed to send transaction {}: {}. Retrying in {:?}",
                        txn_id.id,
                        err,
                        backoff.current()
                    );
                    self.metrics.delivery_retries.fetch_add(1, Ordering::Relaxed);
                    if !backoff.wait(cancel).await {
                        tracing::debug!(
                            txn = txn_id.counter,
                            "Cancelled while waiting to retry transaction {}",
                            txn_id.id
                        );
                        return Err(DeliveryError::Cancelled);
                    }
                    attempt_no += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        dest: &Destination,
        kind: TxnKind,
        txn_id: &str,
        body: &[u8],
        attempt_no: u32,
    ) -> Result<(), DeliveryError> {
        let path_txn_id = if dest.is_proxy {
            self.ids.next_wrapper_id()
        } else {
            txn_id.to_string()
        };
        tracing::debug!(
            "Attempt #{} for transaction {} (path: {})",
            attempt_no,
            txn_id,
            path_txn_id
        );

        let url = transaction_url(&dest.address, &dest.id, &path_txn_id, kind)?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&dest.hs_token)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return match serde_json::from_slice::<MatrixError>(&bytes) {
                Err(_) => Err(DeliveryError::NonJsonError {
                    status: status.as_u16(),
                }),
                Ok(error) if error.is(errcode::WS_NOT_CONNECTED) => {
                    Err(DeliveryError::WebsocketNotConnected)
                }
                Ok(error) => Err(DeliveryError::HttpStatus {
                    status: status.as_u16(),
                    error,
                }),
            };
        }

        let response: TransactionResponse =
            serde_json::from_slice(&bytes).map_err(|e| DeliveryError::MalformedResponse {
                status: status.as_u16(),
                reason: e.to_string(),
            })?;
        check_response(response, &dest.id, status.as_u16(), self.expect_synchronous)?;
        tracing::debug!(
            "Successfully sent transaction {} to {} on attempt #{}",
            txn_id,
            dest.id,
            attempt_no
        );
        Ok(())
    }
}
