//! Engine-level error type.

use tablesync_core::TransitionError;
use tablesync_types::ErrorKind;
use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::exchange::ExchangeError;
use crate::keys::KeyError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Errors returned by [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another sync operation owns the table.
    #[error("table {table} is already synchronizing")]
    AlreadySynchronizing {
        /// Busy table.
        table: String,
    },

    /// The table was never registered with the engine.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The table's state does not allow the request.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The device has no identity yet.
    #[error("device is not registered")]
    NotRegistered,

    /// The operation was cancelled by a stop or disable.
    #[error("sync of {0} was cancelled")]
    Cancelled(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Local storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key management failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Remote failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Export or import failure.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::AlreadySynchronizing { .. } => ErrorKind::Busy,
            EngineError::UnknownTable(_)
            | EngineError::InvalidTransition(_)
            | EngineError::NotRegistered
            | EngineError::Config(_) => ErrorKind::Input,
            EngineError::Cancelled(_) | EngineError::Internal(_) | EngineError::Crypto(_) => {
                ErrorKind::Internal
            }
            EngineError::Store(e) => e.kind(),
            EngineError::Key(e) => e.kind(),
            EngineError::Remote(e) => e.kind(),
            EngineError::Exchange(e) => e.kind(),
        }
    }

    /// Whether local recovery by full resync applies.
    pub(crate) fn is_system_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::CorruptedSystemTable { .. })
                | EngineError::Key(KeyError::Store(StoreError::CorruptedSystemTable { .. }))
        )
    }

    /// The row key a failure is scoped to, if any.
    pub(crate) fn key(&self) -> Option<&str> {
        match self {
            EngineError::Store(StoreError::LocalApplyFailed { key, .. })
            | EngineError::Store(StoreError::InvalidEntry { key, .. })
            | EngineError::Key(KeyError::Undecryptable { key, .. }) => Some(key),
            _ => None,
        }
    }

    /// Whether a live session may reconnect after this failure.
    pub(crate) fn is_recoverable(&self) -> bool {
        self.kind().is_auto_retryable()
    }
}
