//! Remote backend abstraction for tablesync.
//!
//! This module provides a pluggable backend layer that abstracts the remote
//! store holding encrypted change sets and device/key records.
//!
//! # Design
//!
//! - [`RemoteBackend`] is the raw async API (batched download/upload, live
//!   subscription, device and key records, account deletion)
//! - [`RemoteConnector`] wraps a backend with the session credential,
//!   per-call timeouts, response verification and error classification
//! - [`MockBackend`] is an in-memory backend with fault injection
//!
//! # Example
//!
//! ```ignore
//! let backend = MockBackend::new();
//! let connector = RemoteConnector::new(backend, session, device_id, timeout);
//! let batch = connector.download("notes", Timestamp::zero(), 100, KeyVersion::new(1)).await?;
//! ```

mod connector;
mod mock;

pub use connector::RemoteConnector;
pub use mock::MockBackend;

use async_trait::async_trait;
use tablesync_types::{
    CloseReason, DeviceId, DeviceRecord, DownloadBatch, EncryptedEntry, ErrorKind, KeyVersion,
    Timestamp, UploadReceipt, WrappedKey,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Credential attached to every backend call.
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    /// Bearer token from the session provider.
    pub bearer: String,
    /// The calling device.
    pub device_id: DeviceId,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("bearer", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Source of the bearer credential.
///
/// Sign-in flows live outside the engine; it only asks for the current token.
pub trait SessionProvider: Send + Sync {
    /// Current bearer token, or `None` when signed out or expired.
    fn bearer(&self) -> Option<String>;
}

/// A session provider holding a fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    token: Option<String>,
}

impl StaticSession {
    /// Provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provider with no session.
    pub fn signed_out() -> Self {
        Self { token: None }
    }
}

impl SessionProvider for StaticSession {
    fn bearer(&self) -> Option<String> {
        self.token.clone().filter(|t| !t.is_empty())
    }
}

/// One frame received on a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFrame {
    /// Encoded [`LiveMessage`](tablesync_types::LiveMessage) bytes.
    Data(Vec<u8>),
    /// The server closed the stream on purpose.
    Closed(CloseReason),
}

/// Errors reported by a [`RemoteBackend`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Missing, expired or rejected credential.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The account's pending-change budget is exhausted.
    #[error("quota exceeded: {pending} pending of {limit} allowed")]
    QuotaExceeded {
        /// Changes not yet delivered to every device.
        pending: usize,
        /// Account limit.
        limit: usize,
    },

    /// Transient failure (connection refused, reset, overloaded).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Permanent refusal.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Compare-and-set on the table key version lost.
    #[error("key version conflict: server is at {current}")]
    Conflict {
        /// Version the server holds.
        current: KeyVersion,
    },

    /// Unknown device or table.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Raw remote store API.
///
/// Versions and upload timestamps are assigned server-side. Implementations
/// must be safe to call from several tables' tasks at once.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Changes with `uploaded > since`, oldest first, at most `limit`.
    async fn download(
        &self,
        auth: &Auth,
        table: &str,
        since: Timestamp,
        limit: usize,
    ) -> Result<DownloadBatch, BackendError>;

    /// Store entries, assigning each a version and upload timestamp.
    async fn upload(
        &self,
        auth: &Auth,
        table: &str,
        entries: Vec<EncryptedEntry>,
    ) -> Result<Vec<UploadReceipt>, BackendError>;

    /// Open a push channel for changes uploaded by other devices.
    async fn subscribe(
        &self,
        auth: &Auth,
        table: &str,
        since: Timestamp,
    ) -> Result<mpsc::Receiver<LiveFrame>, BackendError>;

    /// Every device authorized on the account.
    async fn devices(&self, auth: &Auth) -> Result<Vec<DeviceRecord>, BackendError>;

    /// Add or replace a device record.
    async fn register_device(&self, auth: &Auth, record: DeviceRecord)
        -> Result<(), BackendError>;

    /// Remove a device and the keys wrapped to it.
    async fn remove_device(&self, auth: &Auth, device_id: DeviceId) -> Result<(), BackendError>;

    /// Current key version of `table` (`KeyVersion::NONE` if none published).
    async fn key_version(&self, auth: &Auth, table: &str) -> Result<KeyVersion, BackendError>;

    /// Publish a new key version, wrapped per device.
    ///
    /// Succeeds only if the table is still at `expected`; otherwise fails
    /// with [`BackendError::Conflict`].
    async fn publish_key(
        &self,
        auth: &Auth,
        table: &str,
        expected: KeyVersion,
        wrapped: Vec<WrappedKey>,
    ) -> Result<(), BackendError>;

    /// Wrapped keys addressed to `device_id` for `table`.
    async fn fetch_keys(
        &self,
        auth: &Auth,
        table: &str,
        device_id: DeviceId,
    ) -> Result<Vec<WrappedKey>, BackendError>;

    /// Record that `device_id` holds `key_version` of `table`.
    async fn acknowledge_key(
        &self,
        auth: &Auth,
        table: &str,
        device_id: DeviceId,
        key_version: KeyVersion,
    ) -> Result<(), BackendError>;

    /// Delete the account and everything stored for it.
    async fn delete_account(&self, auth: &Auth) -> Result<(), BackendError>;
}

/// Remote connector errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// No valid session token.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Pending-change budget exhausted. Sync other devices first.
    #[error("quota exceeded: {pending} pending of {limit} allowed")]
    QuotaExceeded {
        /// Changes not yet delivered to every device.
        pending: usize,
        /// Account limit.
        limit: usize,
    },

    /// Transient network failure.
    #[error("recoverable network error: {0}")]
    Recoverable(String),

    /// The call did not finish in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Call that timed out.
        operation: &'static str,
    },

    /// Permanent failure needing caller action.
    #[error("unrecoverable remote error: {0}")]
    Unrecoverable(String),

    /// A downloaded batch declared an older key version than expected.
    #[error("version verification failed for {table}: expected at least {expected}, got {got}")]
    VersionVerificationFailed {
        /// Affected table.
        table: String,
        /// Active key version locally.
        expected: KeyVersion,
        /// Version the response declared.
        got: KeyVersion,
    },

    /// A live push could not be decoded.
    #[error("invalid live data: {0}")]
    InvalidLiveData(String),

    /// Key publication lost the compare-and-set.
    #[error("key conflict on {table}: server is at {current}")]
    KeyConflict {
        /// Affected table.
        table: String,
        /// Version the server holds.
        current: KeyVersion,
    },
}

impl RemoteError {
    /// Failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Unauthenticated => ErrorKind::Authentication,
            RemoteError::QuotaExceeded { .. } => ErrorKind::Quota,
            RemoteError::Recoverable(_) | RemoteError::Timeout { .. } => {
                ErrorKind::NetworkRecoverable
            }
            RemoteError::Unrecoverable(_) => ErrorKind::NetworkUnrecoverable,
            RemoteError::VersionVerificationFailed { .. } | RemoteError::InvalidLiveData(_) => {
                ErrorKind::Protocol
            }
            RemoteError::KeyConflict { .. } => ErrorKind::KeyState,
        }
    }

    /// Classify a backend error for `table`.
    pub fn from_backend(table: &str, error: BackendError) -> Self {
        match error {
            BackendError::Unauthenticated => RemoteError::Unauthenticated,
            BackendError::QuotaExceeded { pending, limit } => {
                RemoteError::QuotaExceeded { pending, limit }
            }
            BackendError::Unavailable(msg) => RemoteError::Recoverable(msg),
            BackendError::Rejected(msg) => RemoteError::Unrecoverable(msg),
            BackendError::Conflict { current } => RemoteError::KeyConflict {
                table: table.to_string(),
                current,
            },
            BackendError::NotFound(what) => RemoteError::Unrecoverable(format!("not found: {}", what)),
        }
    }
}
