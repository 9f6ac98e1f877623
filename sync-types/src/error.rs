//! Error types shared across tablesync crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Classification of every failure the engine can surface.
///
/// The kind decides how a failure is handled: whether it is retried,
/// surfaced, or triggers recovery. No automatic retry crosses a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad caller input (empty password, malformed import, invalid payload).
    /// Rejected immediately, never retried.
    Input,
    /// Missing or expired credential. Retryable after re-authentication.
    Authentication,
    /// Server incompatible or version verification failed.
    Protocol,
    /// Connection broken, recoverable by internal retry with backoff.
    NetworkRecoverable,
    /// Connection broken in a way that needs caller action.
    NetworkUnrecoverable,
    /// Account's pending-change budget exhausted. Hard stop.
    Quota,
    /// Local metadata or system table corrupted. Recovered by full resync.
    LocalCorruption,
    /// Local storage failed while reading or writing.
    LocalStorage,
    /// Stale key or outstanding rotation acknowledgement. Refused outright.
    KeyState,
    /// Concurrency guard refused the operation.
    Busy,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether the engine may retry this kind on its own.
    pub fn is_auto_retryable(&self) -> bool {
        matches!(self, ErrorKind::NetworkRecoverable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Input => "input",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::NetworkRecoverable => "network (recoverable)",
            ErrorKind::NetworkUnrecoverable => "network (unrecoverable)",
            ErrorKind::Quota => "quota",
            ErrorKind::LocalCorruption => "local corruption",
            ErrorKind::LocalStorage => "local storage",
            ErrorKind::KeyState => "key state",
            ErrorKind::Busy => "busy",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}
