//! Status notifications and aggregate engine status.

use std::time::Duration;

use tablesync_types::{ErrorKind, KeyVersion};

use crate::table::TableState;

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A table changed state.
    StateChanged {
        /// Table whose state changed.
        table: String,
        /// The new state.
        state: TableState,
    },
    /// The live channel for a table is reconnecting.
    Reconnecting {
        /// Affected table.
        table: String,
        /// Which reconnection attempt this is.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// A failure was reported. Exactly one is emitted per failure.
    Error {
        /// Affected table, if the failure is table-scoped.
        table: Option<String>,
        /// Affected key, if the failure is key-scoped.
        key: Option<String>,
        /// Failure classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
    /// A key rotation reached quorum and the new key is active.
    KeyActivated {
        /// Affected table.
        table: String,
        /// The newly active version.
        key_version: KeyVersion,
    },
}

impl StatusEvent {
    /// The table this event concerns, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            StatusEvent::StateChanged { table, .. }
            | StatusEvent::Reconnecting { table, .. }
            | StatusEvent::KeyActivated { table, .. } => Some(table),
            StatusEvent::Error { table, .. } => table.as_deref(),
        }
    }
}

/// Derive the engine-wide status as the worst state across tables.
///
/// Ordered `Error > Disabled > Syncing/LiveSyncing > Idle`. An engine with no
/// tables is `Idle`.
pub fn aggregate_status<'a, I>(states: I) -> TableState
where
    I: IntoIterator<Item = &'a TableState>,
{
    states
        .into_iter()
        .fold(None::<&TableState>, |worst, state| match worst {
            Some(current) if current.severity() >= state.severity() => Some(current),
            _ => Some(state),
        })
        .cloned()
        .unwrap_or_default()
}
