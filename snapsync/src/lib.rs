//! snapsync: block-storage snapshot mirror
//!
//! Creates, updates and deletes snapshots on a cloud block-storage provider,
//! keeps a local record of each one and reconciles that record with the
//! provider through bounded campaigns of queued status refreshes.

pub mod audit;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use error::{GatewayError, SnapshotError};
pub use status::SnapshotStatus;
