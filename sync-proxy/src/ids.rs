//! Process-wide identifier counters.
//!
//! One [`IdGenerator`] is owned by the proxy and shared by every target. Only
//! uniqueness and increase matter; the absolute values carry no meaning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TXN_ID_PREFIX: &str = "fi.mau.syncproxy";
const ERROR_TXN_ID_PREFIX: &str = "fi.mau.syncproxy.error";
const WRAPPER_TXN_ID_PREFIX: &str = "fi.mau.syncproxy.wrapper";

/// Kind of payload a transaction ID is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// A normal transaction.
    Transaction,
    /// An error notification.
    Error,
}

/// A generated transaction ID and the counter value it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnId {
    /// Counter value, used as a short log label.
    pub counter: u64,
    /// Full ID string.
    pub id: String,
}

/// Atomic counters for sync sessions, transaction IDs and wrapper IDs.
#[derive(Debug, Default)]
pub struct IdGenerator {
    sync_sessions: AtomicU64,
    transactions: AtomicU64,
    wrappers: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number for a new sync loop run, used to tell runs apart in logs.
    pub fn next_sync_session(&self) -> u64 {
        self.sync_sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// New ID for a transaction or error notification.
    pub fn next_txn_id(&self, kind: TxnKind) -> TxnId {
        let counter = self.transactions.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix = match kind {
            TxnKind::Transaction => TXN_ID_PREFIX,
            TxnKind::Error => ERROR_TXN_ID_PREFIX,
        };
        TxnId {
            counter,
            id: format_id(prefix, counter),
        }
    }

    /// New wire-path ID for a target that is itself a proxy.
    ///
    /// Drawn from a separate counter so chained relays never see the same
    /// path ID twice even when they share a transaction ID.
    pub fn next_wrapper_id(&self) -> String {
        let counter = self.wrappers.fetch_add(1, Ordering::Relaxed) + 1;
        format_id(WRAPPER_TXN_ID_PREFIX, counter)
    }
}

fn format_id(prefix: &str, counter: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{prefix}_{nanos}_{counter}")
}
