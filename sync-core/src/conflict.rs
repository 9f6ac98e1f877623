//! Conflict resolution for incoming remote changes.
//!
//! Policy: last confirmed write wins. The remote store assigns authoritative
//! versions on upload, so an incoming entry newer than what this device last
//! synced replaces local state, including any local change still pending
//! upload. There is no merge step.
//!
//! An incoming entry that is not newer than the last synced version for its
//! key has already been applied (or superseded) and is skipped. This is what
//! makes applying the same batch twice a no-op.

/// What the local change log knows about one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalKeyState {
    /// Last version confirmed by the remote store (0 if never synced).
    pub synced_version: u64,
    /// Version of the local change waiting for upload, if any.
    pub pending_version: Option<u64>,
}

/// Outcome of comparing an incoming entry against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the remote entry locally.
    ApplyRemote {
        /// A pending local change for the key is discarded.
        discard_local: bool,
    },
    /// Already known locally, nothing to do.
    Skip,
}

/// Resolve an incoming remote version against local state for the same key.
pub fn resolve(local: Option<&LocalKeyState>, incoming_version: u64) -> Resolution {
    match local {
        None => Resolution::ApplyRemote {
            discard_local: false,
        },
        Some(state) if incoming_version <= state.synced_version => Resolution::Skip,
        Some(state) => Resolution::ApplyRemote {
            discard_local: state.pending_version.is_some(),
        },
    }
}

/// Version for the next local write to a key.
///
/// Always above both the synced and the pending version so local versions
/// stay monotonic per key.
pub fn next_local_version(local: Option<&LocalKeyState>) -> u64 {
    match local {
        None => 1,
        Some(state) => state
            .synced_version
            .max(state.pending_version.unwrap_or(0))
            .saturating_add(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(synced: u64, pending: Option<u64>) -> LocalKeyState {
        LocalKeyState {
            synced_version: synced,
            pending_version: pending,
        }
    }

    #[test]
    fn unknown_key_applies() {
        assert_eq!(
            resolve(None, 1),
            Resolution::ApplyRemote {
                discard_local: false
            }
        );
    }

    #[test]
    fn already_synced_version_is_skipped() {
        assert_eq!(resolve(Some(&state(4, None)), 4), Resolution::Skip);
        assert_eq!(resolve(Some(&state(4, None)), 2), Resolution::Skip);
    }

    #[test]
    fn newer_remote_discards_pending_local() {
        // Remote version not newer than the pending local one: remote still wins
        assert_eq!(
            resolve(Some(&state(1, Some(3))), 2),
            Resolution::ApplyRemote {
                discard_local: true
            }
        );
        assert_eq!(
            resolve(Some(&state(1, Some(2))), 5),
            Resolution::ApplyRemote {
                discard_local: true
            }
        );
    }

    #[test]
    fn stale_remote_keeps_pending_local() {
        // A replay of something already synced must not clobber a newer local write
        assert_eq!(resolve(Some(&state(3, Some(4))), 3), Resolution::Skip);
    }

    #[test]
    fn local_versions_are_monotonic() {
        assert_eq!(next_local_version(None), 1);
        assert_eq!(next_local_version(Some(&state(5, None))), 6);
        assert_eq!(next_local_version(Some(&state(5, Some(7)))), 8);
        assert_eq!(next_local_version(Some(&state(9, Some(2)))), 10);
    }
}
