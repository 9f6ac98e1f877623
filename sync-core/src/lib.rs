//! # sync-core
//!
//! Pure logic for tablesync (no I/O, instant tests).
//!
//! This crate implements the state machines and decision rules of the sync
//! engine without any network or disk I/O:
//! - [`TableState`] - guarded per-table engine state
//! - [`ConnectorState`] - per-table remote protocol state, with reconnect
//!   backoff and the invalid-live-data threshold
//! - [`conflict`] - last-confirmed-write-wins resolution
//! - [`PendingRotation`] - key rotation quorum
//! - [`bundle`] - identity export bundle format and schema validation
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. The actual I/O (SQLite, remote calls) is performed by
//! `sync-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod bundle;
pub mod conflict;
pub mod connector;
pub mod rotation;
pub mod status;
pub mod table;

pub use backoff::BackoffPolicy;
pub use bundle::{
    BundleError, BundleKey, IdentityPayload, RemoteEndpoint, SealedBundle, ValidatedIdentity,
};
pub use conflict::{next_local_version, resolve, LocalKeyState, Resolution};
pub use connector::{
    Action, ConnectorEvent, ConnectorPolicy, ConnectorState, Disconnect, Notice,
};
pub use rotation::{next_rotation_version, PendingRotation, RotationError, RotationProgress};
pub use status::{aggregate_status, StatusEvent};
pub use table::{
    is_valid_table_name, TableError, TableEvent, TableState, TransitionError, RESERVED_PREFIX,
};
