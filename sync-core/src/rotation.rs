//! Key rotation quorum.
//!
//! A rotation stages a new key version for a table and waits until every
//! device known at rotation time has acknowledged it. The quorum is an
//! explicit counter on a [`PendingRotation`] record, advanced one
//! acknowledgement at a time; the rotation completes on the last one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tablesync_types::{DeviceId, DeviceRecord, KeyVersion};
use thiserror::Error;

/// Reasons a rotation step is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// This device's view of the table key is behind the server's.
    #[error("stale key state for {table}: local {local}, server {server}")]
    StaleKeyState {
        /// Affected table.
        table: String,
        /// Newest version known locally.
        local: KeyVersion,
        /// Version declared by the server.
        server: KeyVersion,
    },

    /// Some device has not acknowledged the previous rotation.
    #[error("rotation to {version} for {table} still awaits {} device(s)", .outstanding.len())]
    PendingAckOutstanding {
        /// Affected table.
        table: String,
        /// The unacknowledged version.
        version: KeyVersion,
        /// Devices that have not acknowledged.
        outstanding: Vec<DeviceId>,
    },

    /// Acknowledgement for a version other than the one being rotated to.
    #[error("acknowledged {got} but rotation targets {expected}")]
    VersionMismatch {
        /// Version being rotated to.
        expected: KeyVersion,
        /// Version acknowledged.
        got: KeyVersion,
    },

    /// Acknowledgement from a device outside the quorum.
    #[error("device {0} is not part of this rotation")]
    UnknownDevice(DeviceId),
}

/// Progress after an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationProgress {
    /// Still waiting on some devices.
    Waiting {
        /// Devices that have not acknowledged yet.
        outstanding: usize,
    },
    /// Every device acknowledged; the new key is active.
    Completed,
}

/// A staged rotation waiting for quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRotation {
    /// Table being rotated.
    pub table: String,
    /// Version that stays active until quorum.
    pub previous: KeyVersion,
    /// Version being rotated to.
    pub key_version: KeyVersion,
    /// Every device that must acknowledge.
    pub required: BTreeSet<DeviceId>,
    /// Devices that have acknowledged.
    pub acknowledged: BTreeSet<DeviceId>,
}

impl PendingRotation {
    /// Stage a rotation that requires acknowledgement from `devices`.
    pub fn new(
        table: &str,
        previous: KeyVersion,
        key_version: KeyVersion,
        devices: impl IntoIterator<Item = DeviceId>,
    ) -> Self {
        Self {
            table: table.to_string(),
            previous,
            key_version,
            required: devices.into_iter().collect(),
            acknowledged: BTreeSet::new(),
        }
    }

    /// Record one device's acknowledgement.
    ///
    /// Acknowledging twice is harmless.
    pub fn acknowledge(
        &mut self,
        device: DeviceId,
        version: KeyVersion,
    ) -> Result<RotationProgress, RotationError> {
        if version != self.key_version {
            return Err(RotationError::VersionMismatch {
                expected: self.key_version,
                got: version,
            });
        }
        if !self.required.contains(&device) {
            return Err(RotationError::UnknownDevice(device));
        }
        self.acknowledged.insert(device);
        Ok(self.progress())
    }

    /// Drop a device from the quorum (it was removed from the account).
    pub fn forget_device(&mut self, device: &DeviceId) -> RotationProgress {
        self.required.remove(device);
        self.acknowledged.remove(device);
        self.progress()
    }

    /// Devices that still have to acknowledge.
    pub fn outstanding(&self) -> Vec<DeviceId> {
        self.required
            .difference(&self.acknowledged)
            .copied()
            .collect()
    }

    /// Whether quorum was reached.
    pub fn is_complete(&self) -> bool {
        self.required.is_subset(&self.acknowledged)
    }

    fn progress(&self) -> RotationProgress {
        if self.is_complete() {
            RotationProgress::Completed
        } else {
            RotationProgress::Waiting {
                outstanding: self.required.len() - self.acknowledged.len(),
            }
        }
    }
}

/// Decide whether a new rotation may start, returning the version to stage.
///
/// Refused with `PendingAckOutstanding` when any known device has not yet
/// seen the server's current version, and with `StaleKeyState` when this
/// device's newest known version is behind the server.
pub fn next_rotation_version(
    table: &str,
    local_known: KeyVersion,
    server: KeyVersion,
    devices: &[DeviceRecord],
) -> Result<KeyVersion, RotationError> {
    if server.is_some() {
        let outstanding: Vec<DeviceId> = devices
            .iter()
            .filter(|d| d.seen(table) < server)
            .map(|d| d.device_id)
            .collect();
        if !outstanding.is_empty() {
            return Err(RotationError::PendingAckOutstanding {
                table: table.to_string(),
                version: server,
                outstanding,
            });
        }
    }
    if local_known < server {
        return Err(RotationError::StaleKeyState {
            table: table.to_string(),
            local: local_known,
            server,
        });
    }
    Ok(server.next())
}
