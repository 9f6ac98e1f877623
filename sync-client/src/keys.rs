//! Per-table key management and the multi-device rotation protocol.
//!
//! Keys are stored locally wrapped to this device's own public key, one
//! system row per `(table, version)`. Exactly one version per table is
//! active for uploads; every stored version stays usable for decryption,
//! so data sealed before a rotation remains readable.

use std::collections::HashMap;
use std::sync::Arc;

use tablesync_core::{next_rotation_version, PendingRotation, RotationError, RotationProgress};
use tablesync_types::{
    ChangeEntry, DeviceId, DeviceRecord, EncryptedEntry, ErrorKind, KeyVersion, Timestamp,
    WrappedKey,
};
use thiserror::Error;

use crate::crypto::{entry_aad, unwrap_key, wrap_key, CryptoError, DeviceKeyPair, TableKey};
use crate::remote::{RemoteBackend, RemoteConnector, RemoteError};
use crate::store::{LocalStore, StoreError};

const KIND_KEY: &str = "key";
const KIND_ACTIVE: &str = "active";
const KIND_ROTATION: &str = "rotation";

/// Key management errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No key exists for the table yet.
    #[error("no key for table {0}")]
    NoKey(String),

    /// A key exists but cannot be read from the local keystore.
    #[error("key {key_version} for {table} unavailable: {reason}")]
    KeyUnavailable {
        /// Affected table.
        table: String,
        /// Version that could not be read.
        key_version: KeyVersion,
        /// What failed.
        reason: String,
    },

    /// A payload failed authentication.
    #[error("cannot decrypt {table}/{key}")]
    Undecryptable {
        /// Affected table.
        table: String,
        /// Affected key.
        key: String,
    },

    /// No rotation is waiting for acknowledgements.
    #[error("no pending rotation for table {0}")]
    NoPendingRotation(String),

    /// This device is not registered with the backend.
    #[error("device {0} is not registered")]
    DeviceNotRegistered(DeviceId),

    /// Rotation refused.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Local storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl KeyError {
    /// Failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::NoKey(_)
            | KeyError::KeyUnavailable { .. }
            | KeyError::NoPendingRotation(_)
            | KeyError::Rotation(_) => ErrorKind::KeyState,
            KeyError::Undecryptable { .. } => ErrorKind::Protocol,
            KeyError::DeviceNotRegistered(_) => ErrorKind::Input,
            KeyError::Crypto(_) => ErrorKind::Internal,
            KeyError::Store(e) => e.kind(),
            KeyError::Remote(e) => e.kind(),
        }
    }
}

/// Result of starting a rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationTicket {
    /// Rotated table.
    pub table: String,
    /// The staged version.
    pub key_version: KeyVersion,
    /// Quorum progress after the initiator's own acknowledgement.
    pub progress: RotationProgress,
}

/// The device the stored keys are wrapped for, if any key is readable.
///
/// Used to recover the device id when its own row is lost.
pub(crate) async fn keystore_owner(store: &LocalStore) -> Option<DeviceId> {
    let keys: Vec<(String, u32, WrappedKey)> = store.list_system(KIND_KEY, None).await.ok()?;
    keys.into_iter().map(|(_, _, wrapped)| wrapped.device_id).next()
}

/// Drop every key, active marker and pending rotation from `store`.
pub(crate) async fn purge_keystore(store: &LocalStore) -> Result<(), StoreError> {
    for kind in [KIND_KEY, KIND_ACTIVE, KIND_ROTATION] {
        store.delete_system(kind, None).await?;
    }
    tracing::warn!("purged local keystore");
    Ok(())
}

/// Owns table keys for one device.
pub struct KeyManager<B> {
    store: LocalStore,
    remote: RemoteConnector<B>,
    keypair: Arc<dyn DeviceKeyPair>,
    device_id: DeviceId,
}

impl<B> Clone for KeyManager<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: self.remote.clone(),
            keypair: Arc::clone(&self.keypair),
            device_id: self.device_id,
        }
    }
}

impl<B: RemoteBackend> KeyManager<B> {
    /// Create a key manager for the connector's device.
    pub fn new(store: LocalStore, remote: RemoteConnector<B>, keypair: Arc<dyn DeviceKeyPair>) -> Self {
        let device_id = remote.device_id();
        Self {
            store,
            remote,
            keypair,
            device_id,
        }
    }

    /// This device's record as it should appear on the backend.
    pub fn device_record(&self, name: &str) -> DeviceRecord {
        DeviceRecord::new(self.device_id, name, self.keypair.public_key())
    }

    // ===== Local Keystore =====

    /// Active version for `table`, `KeyVersion::NONE` if none yet.
    pub async fn active_version(&self, table: &str) -> Result<KeyVersion, KeyError> {
        let active: Option<KeyVersion> = self.store.get_system(KIND_ACTIVE, table, 0).await?;
        Ok(active.unwrap_or_default())
    }

    /// The key used for uploads to `table`.
    pub async fn active_key(&self, table: &str) -> Result<(KeyVersion, TableKey), KeyError> {
        let version = self.active_version(table).await?;
        if !version.is_some() {
            return Err(KeyError::NoKey(table.to_string()));
        }
        Ok((version, self.key_for(table, version).await?))
    }

    /// Any stored version of `table`'s key.
    pub async fn key_for(&self, table: &str, version: KeyVersion) -> Result<TableKey, KeyError> {
        let unavailable = |reason: String| KeyError::KeyUnavailable {
            table: table.to_string(),
            key_version: version,
            reason,
        };
        let wrapped: WrappedKey = self
            .store
            .get_system(KIND_KEY, table, version.value())
            .await?
            .ok_or_else(|| unavailable("not in keystore".into()))?;
        unwrap_key(self.keypair.as_ref(), self.device_id, &wrapped)
            .map_err(|e| unavailable(e.to_string()))
    }

    /// Newest version stored locally for `table`.
    pub async fn latest_known(&self, table: &str) -> Result<KeyVersion, KeyError> {
        let keys: Vec<(String, u32, WrappedKey)> =
            self.store.list_system(KIND_KEY, Some(table)).await?;
        Ok(keys
            .iter()
            .map(|(_, version, _)| KeyVersion::new(*version))
            .max()
            .unwrap_or_default())
    }

    /// Tables that have an active key.
    pub async fn tables(&self) -> Result<Vec<String>, KeyError> {
        let active: Vec<(String, u32, KeyVersion)> =
            self.store.list_system(KIND_ACTIVE, None).await?;
        Ok(active.into_iter().map(|(table, _, _)| table).collect())
    }

    async fn store_key(
        &self,
        table: &str,
        version: KeyVersion,
        key: &TableKey,
    ) -> Result<(), KeyError> {
        let own = wrap_key(table, version, key, self.device_id, &self.keypair.public_key())?;
        self.store
            .put_system(KIND_KEY, table, version.value(), &own)
            .await?;
        Ok(())
    }

    async fn activate(&self, table: &str, version: KeyVersion) -> Result<(), KeyError> {
        self.store.put_system(KIND_ACTIVE, table, 0, &version).await?;
        tracing::info!("activated key {} for table {}", version, table);
        Ok(())
    }

    /// Store a key obtained out of band (bundle import).
    pub async fn import_key(
        &self,
        table: &str,
        version: KeyVersion,
        key: &TableKey,
        active: bool,
    ) -> Result<(), KeyError> {
        self.store_key(table, version, key).await?;
        if active {
            self.activate(table, version).await?;
        }
        Ok(())
    }

    /// Every stored key with its active flag, for bundle export.
    pub async fn export_keys(&self) -> Result<Vec<(String, KeyVersion, TableKey, bool)>, KeyError> {
        let stored: Vec<(String, u32, WrappedKey)> = self.store.list_system(KIND_KEY, None).await?;
        let mut keys = Vec::with_capacity(stored.len());
        for (table, version, _) in stored {
            let version = KeyVersion::new(version);
            let active = self.active_version(&table).await? == version;
            let key = self.key_for(&table, version).await?;
            keys.push((table, version, key, active));
        }
        Ok(keys)
    }

    /// Remove every key, active marker and pending rotation.
    pub async fn purge(&self) -> Result<(), KeyError> {
        purge_keystore(&self.store).await?;
        Ok(())
    }

    /// Whether a rotation of `table` is waiting for acknowledgements.
    pub async fn pending_rotation(&self, table: &str) -> Result<Option<PendingRotation>, KeyError> {
        Ok(self.store.get_system(KIND_ROTATION, table, 0).await?)
    }

    // ===== Rotation =====

    /// Make sure `table` has an active key, creating version 1 if the
    /// server has none, or fetching the published one otherwise.
    pub async fn ensure_table_key(&self, table: &str) -> Result<KeyVersion, KeyError> {
        let active = self.active_version(table).await?;
        if active.is_some() {
            return Ok(active);
        }

        let server = self.remote.key_version(table).await?;
        if !server.is_some() {
            match self.rotate_key(table).await {
                Ok(ticket) => return Ok(ticket.key_version),
                // Another device published first
                Err(KeyError::Rotation(RotationError::StaleKeyState { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        let active = self.refresh_keys(table).await?;
        if active.is_some() {
            Ok(active)
        } else {
            Err(KeyError::NoKey(table.to_string()))
        }
    }

    /// Stage a new key version for `table`, wrapped for every known device.
    ///
    /// The new key becomes active once every device acknowledged it. Version
    /// 1 is active immediately since no data was sealed before it.
    pub async fn rotate_key(&self, table: &str) -> Result<RotationTicket, KeyError> {
        let devices = self.remote.devices().await?;
        if !devices.iter().any(|d| d.device_id == self.device_id) {
            return Err(KeyError::DeviceNotRegistered(self.device_id));
        }
        let server = self.remote.key_version(table).await?;
        let local_known = self.latest_known(table).await?;
        let version = next_rotation_version(table, local_known, server, &devices)?;

        let key = TableKey::generate()?;
        let wrapped = devices
            .iter()
            .map(|d| wrap_key(table, version, &key, d.device_id, &d.public_key))
            .collect::<Result<Vec<_>, _>>()?;

        self.remote
            .publish_key(table, server, wrapped)
            .await
            .map_err(|e| match e {
                RemoteError::KeyConflict { table, current } => {
                    KeyError::Rotation(RotationError::StaleKeyState {
                        table,
                        local: local_known,
                        server: current,
                    })
                }
                other => KeyError::Remote(other),
            })?;
        self.store_key(table, version, &key).await?;
        self.remote
            .acknowledge_key(table, self.device_id, version)
            .await?;

        let previous = self.active_version(table).await?;
        let mut pending =
            PendingRotation::new(table, previous, version, devices.iter().map(|d| d.device_id));
        pending.acknowledge(self.device_id, version)?;
        tracing::info!(
            "staged key {} for table {} ({} device(s) to acknowledge)",
            version,
            table,
            pending.outstanding().len()
        );
        let progress = self.settle(pending).await?;

        Ok(RotationTicket {
            table: table.to_string(),
            key_version: version,
            progress,
        })
    }

    /// Record `device_id`'s acknowledgement of the pending rotation.
    ///
    /// The new key activates on the last outstanding acknowledgement.
    pub async fn acknowledge_rotation(
        &self,
        table: &str,
        device_id: DeviceId,
        key_version: KeyVersion,
    ) -> Result<RotationProgress, KeyError> {
        let mut pending = self
            .pending_rotation(table)
            .await?
            .ok_or_else(|| KeyError::NoPendingRotation(table.to_string()))?;
        pending.acknowledge(device_id, key_version)?;
        self.remote
            .acknowledge_key(table, device_id, key_version)
            .await?;
        self.settle(pending).await
    }

    /// Persist quorum progress, activating the key once complete.
    async fn settle(&self, pending: PendingRotation) -> Result<RotationProgress, KeyError> {
        let table = pending.table.clone();
        if !pending.previous.is_some() {
            self.activate(&table, pending.key_version).await?;
        }
        if pending.is_complete() {
            if pending.previous.is_some() {
                self.activate(&table, pending.key_version).await?;
            }
            self.store.delete_system(KIND_ROTATION, Some(&table)).await?;
            return Ok(RotationProgress::Completed);
        }
        let outstanding = pending.outstanding().len();
        self.store.put_system(KIND_ROTATION, &table, 0, &pending).await?;
        Ok(RotationProgress::Waiting { outstanding })
    }

    /// Fetch, store and acknowledge the keys addressed to this device.
    ///
    /// Returns the active version afterwards.
    pub async fn refresh_keys(&self, table: &str) -> Result<KeyVersion, KeyError> {
        let wrapped = self.remote.fetch_keys(table).await?;
        let mut newest = KeyVersion::NONE;
        for key in wrapped.iter().filter(|w| w.table == table) {
            // Verify before storing
            unwrap_key(self.keypair.as_ref(), self.device_id, key).map_err(|e| {
                KeyError::KeyUnavailable {
                    table: table.to_string(),
                    key_version: key.key_version,
                    reason: e.to_string(),
                }
            })?;
            self.store
                .put_system(KIND_KEY, table, key.key_version.value(), key)
                .await?;
            newest = newest.max(key.key_version);
        }
        if newest.is_some() {
            self.remote
                .acknowledge_key(table, self.device_id, newest)
                .await?;
            tracing::debug!("fetched keys for {} up to {}", table, newest);
        }
        self.reconcile_quorum(table).await
    }

    /// Advance the pending rotation of `table` from the backend's device
    /// records. Returns the active version afterwards.
    pub async fn reconcile_quorum(&self, table: &str) -> Result<KeyVersion, KeyError> {
        let active = self.active_version(table).await?;
        let latest = self.latest_known(table).await?;
        if latest <= active {
            return Ok(active);
        }

        let devices = self.remote.devices().await?;
        let mut pending = match self.pending_rotation(table).await? {
            Some(pending) if pending.key_version == latest => pending,
            _ => PendingRotation::new(table, active, latest, devices.iter().map(|d| d.device_id)),
        };
        let gone: Vec<DeviceId> = pending
            .required
            .iter()
            .filter(|id| !devices.iter().any(|d| d.device_id == **id))
            .copied()
            .collect();
        for id in &gone {
            pending.forget_device(id);
        }
        for device in &devices {
            if device.seen(table) >= latest && pending.required.contains(&device.device_id) {
                pending.acknowledge(device.device_id, latest)?;
            }
        }
        self.settle(pending).await?;
        self.active_version(table).await
    }

    /// Remove a device from the account and rotate every table key away from it.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<Vec<RotationTicket>, KeyError> {
        self.remote.remove_device(device_id).await?;
        tracing::info!("removed device {}, rotating table keys", device_id);

        let mut tickets = Vec::new();
        for table in self.tables().await? {
            if let Some(mut pending) = self.pending_rotation(&table).await? {
                pending.forget_device(&device_id);
                self.settle(pending).await?;
            }
            tickets.push(self.rotate_key(&table).await?);
        }
        Ok(tickets)
    }

    // ===== Payload Encryption =====

    /// Seal local changes with the active key.
    pub async fn encrypt_batch(
        &self,
        table: &str,
        entries: &[ChangeEntry],
    ) -> Result<Vec<EncryptedEntry>, KeyError> {
        let (key_version, key) = self.active_key(table).await?;
        entries
            .iter()
            .map(|entry| {
                let deleted = entry.is_deletion();
                let aad = entry_aad(table, &entry.key, key_version, deleted);
                let (nonce, ciphertext) =
                    key.seal(entry.payload.as_deref().unwrap_or_default(), &aad)?;
                Ok(EncryptedEntry {
                    table: table.to_string(),
                    key: entry.key.clone(),
                    version: entry.version,
                    key_version,
                    nonce,
                    ciphertext,
                    deleted,
                    uploaded: Timestamp::zero(),
                })
            })
            .collect()
    }

    /// Open sealed entries, each with the key version named in its envelope.
    pub async fn decrypt_batch(
        &self,
        table: &str,
        entries: &[EncryptedEntry],
    ) -> Result<Vec<ChangeEntry>, KeyError> {
        let mut keys: HashMap<KeyVersion, TableKey> = HashMap::new();
        let mut opened = Vec::with_capacity(entries.len());
        for entry in entries {
            if !keys.contains_key(&entry.key_version) {
                let key = self.key_for(table, entry.key_version).await?;
                keys.insert(entry.key_version, key);
            }
            let key = &keys[&entry.key_version];
            let aad = entry_aad(table, &entry.key, entry.key_version, entry.deleted);
            let plaintext = key
                .open(&entry.nonce, &entry.ciphertext, &aad)
                .map_err(|_| KeyError::Undecryptable {
                    table: table.to_string(),
                    key: entry.key.clone(),
                })?;
            opened.push(ChangeEntry {
                table: table.to_string(),
                key: entry.key.clone(),
                version: entry.version,
                payload: (!entry.deleted).then_some(plaintext),
                local_timestamp: entry.uploaded.value(),
            });
        }
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{fill_random, X25519KeyPair};
    use crate::remote::{MockBackend, StaticSession};
    use std::time::Duration;

    async fn device(backend: &MockBackend, name: &str) -> KeyManager<MockBackend> {
        let mut secret = [0u8; 32];
        fill_random(&mut secret).unwrap();
        let remote = RemoteConnector::new(
            Arc::new(backend.clone()),
            Arc::new(StaticSession::new("token")),
            DeviceId::random(),
            Duration::from_secs(2),
        );
        let keys = KeyManager::new(
            LocalStore::in_memory().await.unwrap(),
            remote.clone(),
            Arc::new(X25519KeyPair::from_secret_bytes(secret)),
        );
        remote.register_device(keys.device_record(name)).await.unwrap();
        keys
    }

    // ===== Initial Key Tests =====

    #[tokio::test]
    async fn no_key_before_creation() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        assert!(matches!(a.active_key("notes").await, Err(KeyError::NoKey(_))));

        assert_eq!(a.ensure_table_key("notes").await.unwrap(), KeyVersion::new(1));
        let (version, _) = a.active_key("notes").await.unwrap();
        assert_eq!(version, KeyVersion::new(1));
    }

    #[tokio::test]
    async fn second_device_fetches_published_key() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        assert_eq!(b.ensure_table_key("notes").await.unwrap(), KeyVersion::new(1));

        let (_, ka) = a.active_key("notes").await.unwrap();
        let (_, kb) = b.active_key("notes").await.unwrap();
        assert_eq!(ka, kb);
    }

    #[tokio::test]
    async fn corrupt_wrapped_key_is_unavailable() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        a.ensure_table_key("notes").await.unwrap();

        let mut wrapped: WrappedKey = a.store.get_system(KIND_KEY, "notes", 1).await.unwrap().unwrap();
        wrapped.sealed[0] ^= 0xff;
        a.store.put_system(KIND_KEY, "notes", 1, &wrapped).await.unwrap();

        assert!(matches!(
            a.active_key("notes").await,
            Err(KeyError::KeyUnavailable { .. })
        ));
    }

    // ===== Rotation Tests =====

    #[tokio::test]
    async fn rotation_activates_on_quorum() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        b.ensure_table_key("notes").await.unwrap();

        let ticket = a.rotate_key("notes").await.unwrap();
        assert_eq!(ticket.key_version, KeyVersion::new(2));
        assert_eq!(ticket.progress, RotationProgress::Waiting { outstanding: 1 });
        // Previous key stays active until b acknowledges
        assert_eq!(a.active_version("notes").await.unwrap(), KeyVersion::new(1));

        // b fetches v2; everyone has seen it now
        assert_eq!(b.refresh_keys("notes").await.unwrap(), KeyVersion::new(2));
        assert_eq!(a.reconcile_quorum("notes").await.unwrap(), KeyVersion::new(2));
        assert!(a.pending_rotation("notes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_acknowledgement_completes_rotation() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        b.ensure_table_key("notes").await.unwrap();
        a.rotate_key("notes").await.unwrap();

        let progress = a
            .acknowledge_rotation("notes", b.device_id, KeyVersion::new(2))
            .await
            .unwrap();
        assert_eq!(progress, RotationProgress::Completed);
        assert_eq!(a.active_version("notes").await.unwrap(), KeyVersion::new(2));
    }

    #[tokio::test]
    async fn rotation_refused_while_previous_unacknowledged() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        b.ensure_table_key("notes").await.unwrap();
        a.rotate_key("notes").await.unwrap();

        let err = a.rotate_key("notes").await.unwrap_err();
        assert!(matches!(
            err,
            KeyError::Rotation(RotationError::PendingAckOutstanding { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::KeyState);
        assert_eq!(a.active_version("notes").await.unwrap(), KeyVersion::new(1));
    }

    #[tokio::test]
    async fn stale_device_cannot_rotate() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        b.ensure_table_key("notes").await.unwrap();
        a.rotate_key("notes").await.unwrap();
        // b acknowledges on the backend without storing v2 locally
        backend
            .acknowledge_key(
                &crate::remote::Auth {
                    bearer: "token".into(),
                    device_id: b.device_id,
                },
                "notes",
                b.device_id,
                KeyVersion::new(2),
            )
            .await
            .unwrap();

        assert!(matches!(
            b.rotate_key("notes").await,
            Err(KeyError::Rotation(RotationError::StaleKeyState { .. }))
        ));
    }

    #[tokio::test]
    async fn removing_device_rotates_without_it() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        let b = device(&backend, "b").await;
        a.ensure_table_key("notes").await.unwrap();
        b.ensure_table_key("notes").await.unwrap();

        let tickets = a.remove_device(b.device_id).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].progress, RotationProgress::Completed);
        assert_eq!(a.active_version("notes").await.unwrap(), KeyVersion::new(2));
        // Nothing wrapped for b anymore
        assert!(b.remote.fetch_keys("notes").await.unwrap().is_empty());
    }

    // ===== Payload Tests =====

    #[tokio::test]
    async fn historical_versions_stay_decryptable() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        a.ensure_table_key("notes").await.unwrap();

        let old = a
            .encrypt_batch("notes", &[ChangeEntry::upsert("notes", "k1", 1, b"old".to_vec())])
            .await
            .unwrap();
        a.rotate_key("notes").await.unwrap();
        let new = a
            .encrypt_batch("notes", &[ChangeEntry::tombstone("notes", "k2", 1)])
            .await
            .unwrap();
        assert_eq!(old[0].key_version, KeyVersion::new(1));
        assert_eq!(new[0].key_version, KeyVersion::new(2));

        let mut both = old.clone();
        both.extend(new);
        let opened = a.decrypt_batch("notes", &both).await.unwrap();
        assert_eq!(opened[0].payload.as_deref(), Some(&b"old"[..]));
        assert!(opened[1].is_deletion());
    }

    #[tokio::test]
    async fn tampered_envelope_is_undecryptable() {
        let backend = MockBackend::new();
        let a = device(&backend, "a").await;
        a.ensure_table_key("notes").await.unwrap();
        let mut sealed = a
            .encrypt_batch("notes", &[ChangeEntry::upsert("notes", "k1", 1, b"x".to_vec())])
            .await
            .unwrap();
        // Moving a sealed payload to another key breaks its binding
        sealed[0].key = "k2".into();
        assert!(matches!(
            a.decrypt_batch("notes", &sealed).await,
            Err(KeyError::Undecryptable { .. })
        ));
    }
}
