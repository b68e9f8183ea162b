//! # syncproxy
//!
//! `/sync` relay for encrypted appservices.
//!
//! Appservices don't receive to-device events, device list changes or
//! one-time key counts through the normal transaction push. This crate
//! long-polls the client-server `/sync` endpoint on behalf of each
//! registered bot account and forwards exactly those parts downstream as
//! appservice transactions:
//!
//! ```text
//!  Homeserver                    syncproxy                   Receiver
//!      │   GET /sync (long-poll)   │                            │
//!      │◄──────────────────────────┤  PUT /_matrix/app/v1/      │
//!      ├──────────────────────────►│  transactions/{txn_id}     │
//!      │                           ├───────────────────────────►│
//!      │                           │◄─── sent_to[id] = "ok" ────┤
//!      │   since = next_batch      │                            │
//! ```
//!
//! The resume token only advances after the receiver confirms delivery, so
//! a crash or restart replays from the last confirmed batch.
//!
//! Targets are started and stopped through the control API in [`http`];
//! active targets resume after a restart from the SQLite store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod homeserver;
pub mod http;
pub mod ids;
pub mod registry;
pub mod sender;
pub mod server;
pub mod storage;
pub mod syncer;
pub mod target;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ControlError, ProxyError};
pub use homeserver::{Homeserver, HomeserverClient};
pub use server::{ProxyMetrics, SyncProxy};
pub use storage::{SqliteStore, TargetStore};
pub use target::{SyncTarget, TargetUpdate};
