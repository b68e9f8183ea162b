//! # syncproxy-types
//!
//! Wire format types for the syncproxy `/sync` relay.
//!
//! The relay speaks two protocols it does not own, and this crate holds the
//! narrow slice of each that it needs:
//! - Upstream (client-server API): [`Filter`], [`SyncResponse`] and the
//!   encryption-bootstrap parts inside it ([`ToDeviceEvent`], [`DeviceLists`],
//!   [`OtkCount`])
//! - Downstream (appservice API): [`Transaction`], [`TransactionRequest`],
//!   [`ErrorRequest`] and the [`TransactionResponse`] confirmation
//! - Identity: [`TargetId`], [`UserId`], [`DeviceId`]
//! - Errors: [`MatrixError`] and the well-known error codes in [`errcode`]

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod events;
mod ids;
mod sync;
mod transaction;

pub use error::{errcode, MatrixError};
pub use events::{DeviceLists, OtkCount, ToDeviceEvent};
pub use ids::{DeviceId, TargetId, UserId};
pub use sync::{EventFilter, Filter, RoomFilter, SyncResponse, ToDevice};
pub use transaction::{
    ErrorRequest, ProxyErrorCode, SendStatus, Transaction, TransactionRequest,
    TransactionResponse,
};
