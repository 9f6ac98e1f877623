//! # sync-types
//!
//! Wire and data-model types for the tablesync engine.
//!
//! This crate provides the foundational types used across all tablesync crates:
//! - [`DeviceId`], [`AccountId`], [`KeyVersion`], [`Timestamp`] - Identity and ordering types
//! - [`ChangeEntry`], [`EncryptedEntry`] - Versioned changes and their sealed envelopes
//! - [`LiveMessage`], [`DownloadBatch`], [`DeviceRecord`], [`WrappedKey`] - Remote protocol
//! - [`SyncError`], [`ErrorKind`] - Error types and the failure taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod entry;
mod error;
mod ids;
mod messages;

pub use entry::{now_millis, ChangeEntry, EncryptedEntry};
pub use error::{ErrorKind, SyncError};
pub use ids::{AccountId, DeviceId, KeyVersion, Timestamp};
pub use messages::{
    CloseReason, DeviceRecord, DownloadBatch, LiveMessage, UploadReceipt, WrappedKey,
    PROTOCOL_VERSION,
};
