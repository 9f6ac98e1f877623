//! Engine-level state machine for one synchronized table.
//!
//! One instance exists per registered table, stored in a map keyed by table
//! name. Every transition is guarded: an event that is not valid for the
//! current state is refused with a [`TransitionError`] instead of silently
//! changing state, which is what makes "at most one sync per table" hold.

use serde::{Deserialize, Serialize};
use tablesync_types::ErrorKind;

/// Prefix reserved for the engine's own bookkeeping tables.
pub const RESERVED_PREFIX: &str = "__tablesync";

/// Whether `name` can be used as a synchronized table name.
///
/// Names are interpolated into SQL, so only ASCII identifiers are accepted,
/// and the bookkeeping prefix is reserved.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && name.len() <= 64
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(RESERVED_PREFIX)
}

/// A failure attached to a table in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description of the originating error.
    pub message: String,
}

impl TableError {
    /// Create a table error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Sync state of one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableState {
    /// Nothing running.
    #[default]
    Idle,
    /// A batched sync pass is running.
    Syncing,
    /// Synced and holding a live subscription.
    LiveSyncing,
    /// The last operation failed. Retry is an explicit caller action.
    Error(TableError),
    /// Stopped until explicitly re-enabled.
    Disabled,
}

/// Events that drive a [`TableState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// A batched sync pass was requested.
    SyncRequested,
    /// The pass completed.
    SyncSucceeded {
        /// Whether to continue in live mode.
        live: bool,
    },
    /// An operation failed.
    Failed(TableError),
    /// The live channel was stopped cleanly.
    LiveStopped,
    /// The table is being disabled (by the caller or by an unrecoverable drop).
    Disable,
    /// A disabled table is being re-enabled.
    Enable,
    /// The caller acknowledged an error and wants to retry.
    ClearError,
}

/// Refused transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// State the table was in.
    pub from: TableState,
    /// The refused event.
    pub event: TableEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot apply {:?} in state {:?}", self.event, self.from)
    }
}

impl std::error::Error for TransitionError {}

impl TableState {
    /// Apply an event, returning the next state or refusing the transition.
    pub fn apply(self, event: TableEvent) -> Result<TableState, TransitionError> {
        match (self, event) {
            (Self::Idle, TableEvent::SyncRequested) => Ok(Self::Syncing),
            (Self::Syncing, TableEvent::SyncSucceeded { live: false }) => Ok(Self::Idle),
            (Self::Syncing, TableEvent::SyncSucceeded { live: true }) => Ok(Self::LiveSyncing),
            (Self::Syncing | Self::LiveSyncing, TableEvent::Failed(error)) => Ok(Self::Error(error)),
            (Self::LiveSyncing, TableEvent::LiveStopped) => Ok(Self::Idle),
            (Self::Disabled, TableEvent::Disable) => Ok(Self::Disabled),
            (_, TableEvent::Disable) => Ok(Self::Disabled),
            (Self::Disabled, TableEvent::Enable) => Ok(Self::Idle),
            (Self::Error(_), TableEvent::ClearError) => Ok(Self::Idle),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Severity used for aggregation: `Error > Disabled > Syncing/LiveSyncing > Idle`.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Syncing | Self::LiveSyncing => 1,
            Self::Disabled => 2,
            Self::Error(_) => 3,
        }
    }

    /// Whether a sync operation currently owns the table.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Syncing | Self::LiveSyncing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> TableError {
        TableError::new(ErrorKind::Quota, "pending-change budget exhausted")
    }

    #[test]
    fn table_names() {
        assert!(is_valid_table_name("notes"));
        assert!(is_valid_table_name("_drafts_2"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("2fast"));
        assert!(!is_valid_table_name("notes; DROP TABLE x"));
        assert!(!is_valid_table_name("__tablesync_meta_notes"));
    }

    #[test]
    fn sync_cycle() {
        let state = TableState::Idle.apply(TableEvent::SyncRequested).unwrap();
        assert_eq!(state, TableState::Syncing);
        let state = state.apply(TableEvent::SyncSucceeded { live: false }).unwrap();
        assert_eq!(state, TableState::Idle);
    }

    #[test]
    fn live_cycle() {
        let state = TableState::Syncing
            .apply(TableEvent::SyncSucceeded { live: true })
            .unwrap();
        assert_eq!(state, TableState::LiveSyncing);
        assert_eq!(state.apply(TableEvent::LiveStopped).unwrap(), TableState::Idle);
    }

    #[test]
    fn sync_request_refused_unless_idle() {
        for state in [
            TableState::Syncing,
            TableState::LiveSyncing,
            TableState::Disabled,
            TableState::Error(failure()),
        ] {
            let err = state.clone().apply(TableEvent::SyncRequested).unwrap_err();
            assert_eq!(err.from, state);
        }
    }

    #[test]
    fn failure_attaches_error() {
        let state = TableState::Syncing.apply(TableEvent::Failed(failure())).unwrap();
        assert_eq!(state, TableState::Error(failure()));
        // Error is sticky until cleared
        assert!(state.clone().apply(TableEvent::SyncSucceeded { live: false }).is_err());
        assert_eq!(state.apply(TableEvent::ClearError).unwrap(), TableState::Idle);
    }

    #[test]
    fn disable_from_anywhere_and_enable() {
        for state in [TableState::Idle, TableState::Syncing, TableState::Error(failure())] {
            assert_eq!(state.apply(TableEvent::Disable).unwrap(), TableState::Disabled);
        }
        assert!(TableState::Idle.apply(TableEvent::Enable).is_err());
        assert_eq!(
            TableState::Disabled.apply(TableEvent::Enable).unwrap(),
            TableState::Idle
        );
    }

    #[test]
    fn finishing_after_disable_is_refused() {
        let err = TableState::Disabled
            .apply(TableEvent::SyncSucceeded { live: false })
            .unwrap_err();
        assert_eq!(err.from, TableState::Disabled);
    }

    #[test]
    fn severity_order() {
        assert!(TableState::Error(failure()).severity() > TableState::Disabled.severity());
        assert!(TableState::Disabled.severity() > TableState::LiveSyncing.severity());
        assert_eq!(
            TableState::Syncing.severity(),
            TableState::LiveSyncing.severity()
        );
        assert!(TableState::Syncing.severity() > TableState::Idle.severity());
    }
}
