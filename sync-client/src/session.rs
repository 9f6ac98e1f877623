//! Ephemeral per-table sync session.

use tablesync_core::{Action, ConnectorEvent, ConnectorPolicy, ConnectorState};
use tokio::sync::watch;

/// Protocol state of one running sync operation.
///
/// Owned by the task driving the table; dropped when the table returns to
/// `Idle` or is disabled.
#[derive(Debug)]
pub(crate) struct SyncSession {
    table: String,
    state: ConnectorState,
    policy: ConnectorPolicy,
    cancel: watch::Receiver<bool>,
}

impl SyncSession {
    pub(crate) fn new(table: &str, policy: ConnectorPolicy, cancel: watch::Receiver<bool>) -> Self {
        Self {
            table: table.to_string(),
            state: ConnectorState::new(),
            policy,
            cancel,
        }
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn state(&self) -> &ConnectorState {
        &self.state
    }

    /// Feed an event to the connector state machine.
    pub(crate) fn handle(&mut self, event: ConnectorEvent) -> Vec<Action> {
        let (state, actions) = std::mem::take(&mut self.state).on_event(event, &self.policy);
        tracing::trace!("{}: connector -> {:?}", self.table, state);
        self.state = state;
        actions
    }

    /// A receiver that resolves [`cancelled`] for this session.
    pub(crate) fn cancel_handle(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }
}

/// Resolves once the session's table was disabled or stopped.
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling: never resolves
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn session_tracks_connector_state() {
        let (_tx, rx) = watch::channel(false);
        let mut session = SyncSession::new("notes", ConnectorPolicy::default(), rx);
        assert_eq!(session.handle(ConnectorEvent::SyncRequested), vec![Action::Download]);
        assert_eq!(session.state(), &ConnectorState::Downloading);
        assert_eq!(session.table(), "notes");
    }

    #[tokio::test]
    async fn cancellation_resolves() {
        let (tx, rx) = watch::channel(false);
        let session = SyncSession::new("notes", ConnectorPolicy::default(), rx);
        let waiter = tokio::spawn(cancelled(session.cancel_handle()));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_never_cancels() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(50), cancelled(rx)).await;
        assert!(result.is_err());
    }
}
