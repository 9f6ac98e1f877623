//! Per-table remote protocol state machine.
//!
//! This module provides a pure, side-effect-free state machine for one
//! table's conversation with the remote store: a batched download/upload
//! pass, optionally followed by a live subscription. The state machine takes
//! events as input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O is performed by sync-client, not by this module.

use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Tunables consulted by [`ConnectorState::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorPolicy {
    /// Reconnect backoff for the live channel.
    pub backoff: BackoffPolicy,
    /// Consecutive invalid live frames tolerated before giving up.
    pub invalid_data_threshold: u32,
}

impl Default for ConnectorPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            invalid_data_threshold: 5,
        }
    }
}

/// Protocol state of one table - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectorState {
    /// No remote activity.
    #[default]
    Idle,
    /// Pulling remote changes.
    Downloading,
    /// Pushing local pending changes.
    Uploading,
    /// Opening (or reopening) the live subscription.
    LiveConnecting {
        /// Reconnect attempt this connect belongs to (0 for the first connect).
        attempt: u32,
    },
    /// Subscribed, downloading what was missed and uploading what piled up.
    ///
    /// The reconnect attempt only counts as successful once this finishes.
    CatchingUp {
        /// Reconnect attempt this catch-up belongs to.
        attempt: u32,
    },
    /// Subscribed and receiving pushes.
    LiveConnected {
        /// Consecutive invalid frames received.
        invalid_frames: u32,
    },
    /// Live channel dropped, waiting to reconnect.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
    /// Stopped until explicitly re-enabled.
    Disabled {
        /// Why the table was disabled.
        reason: String,
    },
}

/// How a lost connection should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Network blip: reconnect with backoff.
    Recoverable {
        /// Error message describing the failure.
        error: String,
    },
    /// Server closed the stream on purpose: stop.
    Unrecoverable {
        /// Reason given by the server.
        reason: String,
    },
}

impl ConnectorState {
    /// Create a state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: ConnectorEvent, policy: &ConnectorPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Disable wins from anywhere, including Disabled itself
            (Self::Disabled { reason }, ConnectorEvent::DisableRequested { .. }) => {
                (Self::Disabled { reason }, vec![])
            }
            (_, ConnectorEvent::DisableRequested { reason }) => disable(reason),

            // Batched pass
            (Self::Idle, ConnectorEvent::SyncRequested) => (Self::Downloading, vec![Action::Download]),
            (Self::Downloading, ConnectorEvent::DownloadFinished) => {
                (Self::Uploading, vec![Action::Upload])
            }
            (Self::Uploading, ConnectorEvent::UploadFinished { live: false }) => {
                (Self::Idle, vec![Action::EndSession])
            }
            (Self::Uploading, ConnectorEvent::UploadFinished { live: true }) => (
                Self::LiveConnecting { attempt: 0 },
                vec![Action::Subscribe],
            ),
            (Self::Downloading | Self::Uploading, ConnectorEvent::PassFailed) => {
                (Self::Idle, vec![Action::EndSession])
            }

            // Live channel
            (Self::LiveConnecting { attempt }, ConnectorEvent::LiveEstablished) => {
                (Self::CatchingUp { attempt }, vec![Action::CatchUp])
            }
            (Self::CatchingUp { .. }, ConnectorEvent::CaughtUp) => (
                Self::LiveConnected { invalid_frames: 0 },
                vec![Action::Emit(Notice::LiveConnected)],
            ),
            (Self::LiveConnected { .. }, ConnectorEvent::LiveDataApplied) => {
                (Self::LiveConnected { invalid_frames: 0 }, vec![])
            }
            (Self::LiveConnected { .. }, ConnectorEvent::LocalChanges) => {
                (Self::LiveConnected { invalid_frames: 0 }, vec![Action::Upload])
            }
            (Self::LiveConnected { invalid_frames }, ConnectorEvent::InvalidLiveData { error }) => {
                let count = invalid_frames.saturating_add(1);
                if count >= policy.invalid_data_threshold {
                    let reason = format!(
                        "{} consecutive invalid live frames, last: {}",
                        count, error
                    );
                    let (state, mut actions) = disable(reason);
                    actions.insert(0, Action::Emit(Notice::InvalidLiveData { count, error }));
                    (state, actions)
                } else {
                    (
                        Self::LiveConnected {
                            invalid_frames: count,
                        },
                        vec![Action::Emit(Notice::InvalidLiveData { count, error })],
                    )
                }
            }
            (
                Self::LiveConnecting { attempt } | Self::CatchingUp { attempt },
                ConnectorEvent::ConnectionLost(Disconnect::Recoverable { error }),
            ) => reconnect(attempt.saturating_add(1), error, policy),
            (
                Self::LiveConnected { .. },
                ConnectorEvent::ConnectionLost(Disconnect::Recoverable { error }),
            ) => reconnect(1, error, policy),
            (
                Self::LiveConnecting { .. }
                | Self::CatchingUp { .. }
                | Self::LiveConnected { .. }
                | Self::Reconnecting { .. },
                ConnectorEvent::ConnectionLost(Disconnect::Unrecoverable { reason }),
            ) => disable(reason),
            (Self::Reconnecting { attempt }, ConnectorEvent::ReconnectTimer) => {
                (Self::LiveConnecting { attempt }, vec![Action::Subscribe])
            }
            (
                Self::LiveConnecting { .. }
                | Self::CatchingUp { .. }
                | Self::LiveConnected { .. }
                | Self::Reconnecting { .. },
                ConnectorEvent::StopRequested,
            ) => (Self::Idle, vec![Action::Unsubscribe, Action::EndSession]),

            // Re-enable
            (Self::Disabled { .. }, ConnectorEvent::EnableRequested) => (Self::Idle, vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if any remote operation is active.
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Idle | Self::Disabled { .. })
    }

    /// Check if the live subscription is up.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::LiveConnected { .. })
    }
}

fn reconnect(attempt: u32, error: String, policy: &ConnectorPolicy) -> (ConnectorState, Vec<Action>) {
    if policy.backoff.is_exhausted(attempt) {
        return disable(format!(
            "gave up after {} reconnect attempts: {}",
            attempt - 1,
            error
        ));
    }
    let delay = policy.backoff.delay_for(attempt);
    (
        ConnectorState::Reconnecting { attempt },
        vec![
            Action::Emit(Notice::Reconnecting {
                attempt,
                delay,
                error,
            }),
            Action::StartReconnectTimer { delay },
        ],
    )
}

fn disable(reason: String) -> (ConnectorState, Vec<Action>) {
    (
        ConnectorState::Disabled {
            reason: reason.clone(),
        },
        vec![
            Action::CancelInFlight,
            Action::EndSession,
            Action::Emit(Notice::Disabled { reason }),
        ],
    )
}

/// Events that can occur while talking to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// Engine requested a batched sync pass.
    SyncRequested,
    /// All pages were downloaded and applied.
    DownloadFinished,
    /// All pending changes were uploaded.
    UploadFinished {
        /// Whether to continue with a live subscription.
        live: bool,
    },
    /// The batched pass failed.
    PassFailed,
    /// Live subscription is open.
    LiveEstablished,
    /// The post-connect catch-up finished.
    CaughtUp,
    /// A live push was decrypted and applied.
    LiveDataApplied,
    /// Local writes are waiting to be uploaded.
    LocalChanges,
    /// A live push could not be decoded or decrypted.
    InvalidLiveData {
        /// Error message describing the failure.
        error: String,
    },
    /// The live channel was lost.
    ConnectionLost(Disconnect),
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Engine requested the live channel to stop.
    StopRequested,
    /// Table is being disabled.
    DisableRequested {
        /// Why the table is being disabled.
        reason: String,
    },
    /// Table is being re-enabled.
    EnableRequested,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Download and apply remote changes.
    Download,
    /// Upload pending local changes.
    Upload,
    /// Open the live subscription.
    Subscribe,
    /// Download anything missed while the live channel was down, then
    /// upload local changes made meanwhile.
    CatchUp,
    /// Close the live subscription.
    Unsubscribe,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any in-flight network operation.
    CancelInFlight,
    /// Release the table's session resources.
    EndSession,
    /// Report something to the application.
    Emit(Notice),
}

/// Connector notices surfaced to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Live subscription established.
    LiveConnected,
    /// Reconnect scheduled.
    Reconnecting {
        /// Which reconnection attempt this is.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
        /// The error that caused the drop.
        error: String,
    },
    /// A live push was rejected.
    InvalidLiveData {
        /// Consecutive invalid frames so far.
        count: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// The table was disabled.
    Disabled {
        /// Why the table was disabled.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ConnectorPolicy {
        ConnectorPolicy {
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 4),
            invalid_data_threshold: 3,
        }
    }

    fn live_connected() -> ConnectorState {
        ConnectorState::LiveConnected { invalid_frames: 0 }
    }

    fn lost() -> ConnectorEvent {
        ConnectorEvent::ConnectionLost(Disconnect::Recoverable {
            error: "reset by peer".into(),
        })
    }

    // ===== Batched Pass Tests =====

    #[test]
    fn batched_pass_ends_idle() {
        let p = policy();
        let (state, actions) = ConnectorState::new().on_event(ConnectorEvent::SyncRequested, &p);
        assert_eq!(state, ConnectorState::Downloading);
        assert_eq!(actions, vec![Action::Download]);

        let (state, actions) = state.on_event(ConnectorEvent::DownloadFinished, &p);
        assert_eq!(state, ConnectorState::Uploading);
        assert_eq!(actions, vec![Action::Upload]);

        let (state, actions) = state.on_event(ConnectorEvent::UploadFinished { live: false }, &p);
        assert_eq!(state, ConnectorState::Idle);
        assert_eq!(actions, vec![Action::EndSession]);
    }

    #[test]
    fn live_pass_subscribes_after_upload() {
        let (state, actions) =
            ConnectorState::Uploading.on_event(ConnectorEvent::UploadFinished { live: true }, &policy());
        assert_eq!(state, ConnectorState::LiveConnecting { attempt: 0 });
        assert_eq!(actions, vec![Action::Subscribe]);
    }

    #[test]
    fn sync_request_outside_idle_is_ignored() {
        let (state, actions) = ConnectorState::Uploading.on_event(ConnectorEvent::SyncRequested, &policy());
        assert_eq!(state, ConnectorState::Uploading);
        assert!(actions.is_empty());
    }

    // ===== Reconnect Tests =====

    #[test]
    fn recoverable_loss_schedules_reconnect() {
        let (state, actions) = live_connected().on_event(lost(), &policy());
        assert_eq!(state, ConnectorState::Reconnecting { attempt: 1 });
        assert!(actions.contains(&Action::StartReconnectTimer {
            delay: Duration::from_secs(1)
        }));
        assert!(matches!(
            actions[0],
            Action::Emit(Notice::Reconnecting { attempt: 1, .. })
        ));
    }

    #[test]
    fn repeated_failures_increase_delay_then_disable() {
        let p = policy();
        let (mut state, _) = live_connected().on_event(lost(), &p);
        let mut delays = Vec::new();
        loop {
            let (next, _) = state.on_event(ConnectorEvent::ReconnectTimer, &p);
            let (next, actions) = next.on_event(lost(), &p);
            state = next;
            match actions.iter().find_map(|a| match a {
                Action::StartReconnectTimer { delay } => Some(*delay),
                _ => None,
            }) {
                Some(delay) => delays.push(delay),
                None => break,
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert!(matches!(state, ConnectorState::Disabled { .. }));
    }

    #[test]
    fn successful_reconnect_resets_attempts() {
        let p = policy();
        let (state, _) = live_connected().on_event(lost(), &p);
        let (state, _) = state.on_event(ConnectorEvent::ReconnectTimer, &p);
        let (state, actions) = state.on_event(ConnectorEvent::LiveEstablished, &p);
        assert_eq!(state, ConnectorState::CatchingUp { attempt: 1 });
        assert_eq!(actions, vec![Action::CatchUp]);

        let (state, actions) = state.on_event(ConnectorEvent::CaughtUp, &p);
        assert!(state.is_live());
        assert_eq!(actions, vec![Action::Emit(Notice::LiveConnected)]);

        let (state, _) = state.on_event(lost(), &p);
        assert_eq!(state, ConnectorState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn failed_catch_up_keeps_counting_attempts() {
        let p = policy();
        let (mut state, _) = live_connected().on_event(lost(), &p);
        let mut attempts = vec![1];
        loop {
            let (next, _) = state.on_event(ConnectorEvent::ReconnectTimer, &p);
            let (next, _) = next.on_event(ConnectorEvent::LiveEstablished, &p);
            let (next, _) = next.on_event(lost(), &p);
            state = next;
            match state {
                ConnectorState::Reconnecting { attempt } => attempts.push(attempt),
                _ => break,
            }
        }
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert!(matches!(state, ConnectorState::Disabled { .. }));
    }

    #[test]
    fn unrecoverable_loss_disables() {
        let (state, actions) = live_connected().on_event(
            ConnectorEvent::ConnectionLost(Disconnect::Unrecoverable {
                reason: "table deleted remotely".into(),
            }),
            &policy(),
        );
        assert_eq!(
            state,
            ConnectorState::Disabled {
                reason: "table deleted remotely".into()
            }
        );
        assert!(actions.contains(&Action::CancelInFlight));
    }

    #[test]
    fn disabled_ignores_reconnect_timer() {
        let state = ConnectorState::Disabled {
            reason: "x".into(),
        };
        let (state, actions) = state.on_event(ConnectorEvent::ReconnectTimer, &policy());
        assert!(matches!(state, ConnectorState::Disabled { .. }));
        assert!(actions.is_empty());
    }

    // ===== Invalid Data Tests =====

    #[test]
    fn invalid_frames_are_tolerated_below_threshold() {
        let p = policy();
        let bad = || ConnectorEvent::InvalidLiveData {
            error: "bad frame".into(),
        };
        let (state, _) = live_connected().on_event(bad(), &p);
        let (state, _) = state.on_event(bad(), &p);
        assert_eq!(state, ConnectorState::LiveConnected { invalid_frames: 2 });

        // A good frame resets the streak
        let (state, _) = state.on_event(ConnectorEvent::LiveDataApplied, &p);
        let (state, _) = state.on_event(bad(), &p);
        assert_eq!(state, ConnectorState::LiveConnected { invalid_frames: 1 });
    }

    #[test]
    fn invalid_frames_past_threshold_disable() {
        let p = policy();
        let mut state = live_connected();
        for _ in 0..3 {
            state = state
                .on_event(
                    ConnectorEvent::InvalidLiveData {
                        error: "bad frame".into(),
                    },
                    &p,
                )
                .0;
        }
        assert!(matches!(state, ConnectorState::Disabled { .. }));
    }

    // ===== Disable / Enable Tests =====

    #[test]
    fn disable_from_download_cancels() {
        let (state, actions) = ConnectorState::Downloading.on_event(
            ConnectorEvent::DisableRequested {
                reason: "user".into(),
            },
            &policy(),
        );
        assert!(!state.is_networked());
        assert_eq!(actions[0], Action::CancelInFlight);
    }

    #[test]
    fn enable_returns_to_idle() {
        let state = ConnectorState::Disabled {
            reason: "x".into(),
        };
        let (state, _) = state.on_event(ConnectorEvent::EnableRequested, &policy());
        assert_eq!(state, ConnectorState::Idle);
    }
}
