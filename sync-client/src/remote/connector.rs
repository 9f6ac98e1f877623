//! Remote connector: the protocol client over a [`RemoteBackend`].
//!
//! Attaches the session credential to every call, bounds every call with a
//! timeout, verifies downloaded batches and classifies failures.

use super::{Auth, LiveFrame, RemoteBackend, RemoteError, SessionProvider};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tablesync_types::{
    DeviceId, DeviceRecord, DownloadBatch, EncryptedEntry, KeyVersion, LiveMessage, Timestamp,
    UploadReceipt, WrappedKey,
};
use tokio::sync::mpsc;

/// Protocol client for one device.
pub struct RemoteConnector<B> {
    backend: Arc<B>,
    session: Arc<dyn SessionProvider>,
    device_id: DeviceId,
    timeout: Duration,
}

impl<B> Clone for RemoteConnector<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            session: Arc::clone(&self.session),
            device_id: self.device_id,
            timeout: self.timeout,
        }
    }
}

impl<B: RemoteBackend> RemoteConnector<B> {
    /// Create a connector for `device_id`.
    pub fn new(
        backend: Arc<B>,
        session: Arc<dyn SessionProvider>,
        device_id: DeviceId,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            session,
            device_id,
            timeout,
        }
    }

    /// The device this connector speaks for.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn auth(&self) -> Result<Auth, RemoteError> {
        let bearer = self.session.bearer().ok_or(RemoteError::Unauthenticated)?;
        Ok(Auth {
            bearer,
            device_id: self.device_id,
        })
    }

    async fn call<T, F>(
        &self,
        table: &str,
        operation: &'static str,
        request: F,
    ) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, super::BackendError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|e| RemoteError::from_backend(table, e)),
            Err(_) => {
                tracing::debug!("{} for {} timed out after {:?}", operation, table, self.timeout);
                Err(RemoteError::Timeout { operation })
            }
        }
    }

    /// Fetch one page of changes uploaded after `since`.
    ///
    /// Fails with `VersionVerificationFailed` if the batch declares a key
    /// version below `expected`, or carries an entry sealed with a version
    /// newer than the batch declares.
    pub async fn download(
        &self,
        table: &str,
        since: Timestamp,
        limit: usize,
        expected: KeyVersion,
    ) -> Result<DownloadBatch, RemoteError> {
        let auth = self.auth()?;
        let batch = self
            .call(table, "download", self.backend.download(&auth, table, since, limit))
            .await?;

        if batch.table_key_version < expected {
            return Err(RemoteError::VersionVerificationFailed {
                table: table.to_string(),
                expected,
                got: batch.table_key_version,
            });
        }
        if let Some(entry) = batch
            .entries
            .iter()
            .find(|e| e.key_version > batch.table_key_version)
        {
            return Err(RemoteError::VersionVerificationFailed {
                table: table.to_string(),
                expected: batch.table_key_version,
                got: entry.key_version,
            });
        }
        if let Some(entry) = batch.entries.iter().find(|e| e.table != table) {
            return Err(RemoteError::Unrecoverable(format!(
                "download for {} returned an entry of {}",
                table, entry.table
            )));
        }

        tracing::debug!("downloaded {} change(s) for {}", batch.entries.len(), table);
        Ok(batch)
    }

    /// Upload sealed entries, returning one receipt per entry.
    pub async fn upload(
        &self,
        table: &str,
        entries: Vec<EncryptedEntry>,
    ) -> Result<Vec<UploadReceipt>, RemoteError> {
        let auth = self.auth()?;
        let count = entries.len();
        let receipts = self
            .call(table, "upload", self.backend.upload(&auth, table, entries))
            .await?;
        if receipts.len() != count {
            return Err(RemoteError::Unrecoverable(format!(
                "upload of {} entries returned {} receipts",
                count,
                receipts.len()
            )));
        }
        tracing::debug!("uploaded {} change(s) for {}", count, table);
        Ok(receipts)
    }

    /// Open the live channel for `table`.
    pub async fn subscribe(
        &self,
        table: &str,
        since: Timestamp,
    ) -> Result<mpsc::Receiver<LiveFrame>, RemoteError> {
        let auth = self.auth()?;
        self.call(table, "subscribe", self.backend.subscribe(&auth, table, since))
            .await
    }

    /// Decode a live data frame into sealed entries for `table`.
    ///
    /// A keepalive decodes to no entries.
    pub fn decode_live(&self, table: &str, bytes: &[u8]) -> Result<Vec<EncryptedEntry>, RemoteError> {
        match LiveMessage::from_bytes(bytes) {
            Ok(LiveMessage::Changes {
                table: pushed,
                entries,
            }) => {
                if pushed != table || entries.iter().any(|e| e.table != table) {
                    return Err(RemoteError::InvalidLiveData(format!(
                        "push for {} arrived on the {} channel",
                        pushed, table
                    )));
                }
                Ok(entries)
            }
            Ok(LiveMessage::Ping) => Ok(Vec::new()),
            Err(e) => Err(RemoteError::InvalidLiveData(e.to_string())),
        }
    }

    /// Every device on the account.
    pub async fn devices(&self) -> Result<Vec<DeviceRecord>, RemoteError> {
        let auth = self.auth()?;
        self.call("", "devices", self.backend.devices(&auth)).await
    }

    /// Add or replace a device record.
    pub async fn register_device(&self, record: DeviceRecord) -> Result<(), RemoteError> {
        let auth = self.auth()?;
        self.call("", "register_device", self.backend.register_device(&auth, record))
            .await
    }

    /// Remove a device from the account.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<(), RemoteError> {
        let auth = self.auth()?;
        self.call("", "remove_device", self.backend.remove_device(&auth, device_id))
            .await
    }

    /// The table's key version on the server.
    pub async fn key_version(&self, table: &str) -> Result<KeyVersion, RemoteError> {
        let auth = self.auth()?;
        self.call(table, "key_version", self.backend.key_version(&auth, table))
            .await
    }

    /// Compare-and-set publication of a new key version.
    pub async fn publish_key(
        &self,
        table: &str,
        expected: KeyVersion,
        wrapped: Vec<WrappedKey>,
    ) -> Result<(), RemoteError> {
        let auth = self.auth()?;
        self.call(
            table,
            "publish_key",
            self.backend.publish_key(&auth, table, expected, wrapped),
        )
        .await
    }

    /// Wrapped keys addressed to this device.
    pub async fn fetch_keys(&self, table: &str) -> Result<Vec<WrappedKey>, RemoteError> {
        let auth = self.auth()?;
        self.call(
            table,
            "fetch_keys",
            self.backend.fetch_keys(&auth, table, self.device_id),
        )
        .await
    }

    /// Record that `device_id` holds `key_version`.
    pub async fn acknowledge_key(
        &self,
        table: &str,
        device_id: DeviceId,
        key_version: KeyVersion,
    ) -> Result<(), RemoteError> {
        let auth = self.auth()?;
        self.call(
            table,
            "acknowledge_key",
            self.backend.acknowledge_key(&auth, table, device_id, key_version),
        )
        .await
    }

    /// Delete the account remotely.
    pub async fn delete_account(&self) -> Result<(), RemoteError> {
        let auth = self.auth()?;
        self.call("", "delete_account", self.backend.delete_account(&auth))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockBackend, StaticSession};

    fn connector(backend: &MockBackend, session: StaticSession) -> RemoteConnector<MockBackend> {
        RemoteConnector::new(
            Arc::new(backend.clone()),
            Arc::new(session),
            DeviceId::random(),
            Duration::from_millis(200),
        )
    }

    async fn published(backend: &MockBackend) -> RemoteConnector<MockBackend> {
        let remote = connector(backend, StaticSession::new("token"));
        let me = remote.device_id();
        remote
            .register_device(DeviceRecord::new(me, "me", [5u8; 32]))
            .await
            .unwrap();
        remote
            .publish_key(
                "notes",
                KeyVersion::NONE,
                vec![WrappedKey {
                    table: "notes".into(),
                    key_version: KeyVersion::new(1),
                    device_id: me,
                    ephemeral_public: [0u8; 32],
                    nonce: [0u8; 24],
                    sealed: vec![],
                }],
            )
            .await
            .unwrap();
        remote
    }

    fn sealed(key: &str, key_version: u32) -> EncryptedEntry {
        EncryptedEntry {
            table: "notes".into(),
            key: key.into(),
            version: 1,
            key_version: KeyVersion::new(key_version),
            nonce: [0u8; 24],
            ciphertext: vec![0],
            deleted: false,
            uploaded: Timestamp::zero(),
        }
    }

    #[tokio::test]
    async fn missing_session_is_unauthenticated() {
        let backend = MockBackend::new();
        let remote = connector(&backend, StaticSession::signed_out());
        let result = remote.upload("notes", vec![sealed("k", 1)]).await;
        assert_eq!(result, Err(RemoteError::Unauthenticated));
        // Nothing reached the backend
        assert_eq!(backend.call_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_recoverable() {
        let backend = MockBackend::new();
        let remote = published(&backend).await;
        backend.set_latency(Some(Duration::from_secs(5)));

        let err = remote
            .download("notes", Timestamp::zero(), 10, KeyVersion::new(1))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Timeout { operation: "download" });
        assert!(err.kind().is_auto_retryable());
    }

    #[tokio::test]
    async fn older_declared_key_version_fails_verification() {
        let backend = MockBackend::new();
        let remote = published(&backend).await;
        backend.declare_key_version("notes", Some(KeyVersion::NONE));

        let err = remote
            .download("notes", Timestamp::zero(), 10, KeyVersion::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::VersionVerificationFailed { .. }));
    }

    #[tokio::test]
    async fn entry_newer_than_declared_version_fails_verification() {
        let backend = MockBackend::new();
        let remote = published(&backend).await;
        remote.upload("notes", vec![sealed("k", 1)]).await.unwrap();
        backend.declare_key_version("notes", Some(KeyVersion::NONE));

        let err = remote
            .download("notes", Timestamp::zero(), 10, KeyVersion::NONE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteError::VersionVerificationFailed { got, .. } if got == KeyVersion::new(1)
        ));
    }

    #[tokio::test]
    async fn live_frames_decode() {
        let backend = MockBackend::new();
        let remote = connector(&backend, StaticSession::new("token"));

        let bytes = LiveMessage::Changes {
            table: "notes".into(),
            entries: vec![sealed("k", 1)],
        }
        .to_bytes()
        .unwrap();
        assert_eq!(remote.decode_live("notes", &bytes).unwrap().len(), 1);
        assert!(matches!(
            remote.decode_live("tasks", &bytes),
            Err(RemoteError::InvalidLiveData(_))
        ));
        assert!(matches!(
            remote.decode_live("notes", b"garbage"),
            Err(RemoteError::InvalidLiveData(_))
        ));
        let ping = LiveMessage::Ping.to_bytes().unwrap();
        assert!(remote.decode_live("notes", &ping).unwrap().is_empty());
    }
}
