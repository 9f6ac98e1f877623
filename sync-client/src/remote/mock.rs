//! In-memory backend for testing.
//!
//! Keeps one latest entry per key, assigns versions and upload timestamps the
//! way a real backend would, pushes uploads to live subscribers, and lets
//! tests inject failures, latency and server-side closes.

use super::{Auth, BackendError, LiveFrame, RemoteBackend};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tablesync_types::{
    CloseReason, DeviceId, DeviceRecord, DownloadBatch, EncryptedEntry, KeyVersion, LiveMessage,
    Timestamp, UploadReceipt, WrappedKey,
};
use tokio::sync::mpsc;

const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Mock backend for testing.
///
/// Cloning shares state, so several engines can talk to one backend.
#[derive(Debug, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockBackendInner>>,
}

#[derive(Debug)]
struct StoredEntry {
    entry: EncryptedEntry,
    uploader: DeviceId,
}

#[derive(Debug, Default)]
struct TableRecord {
    entries: BTreeMap<String, StoredEntry>,
    key_version: KeyVersion,
    declared_key_version: Option<KeyVersion>,
    wrapped: Vec<WrappedKey>,
    subscribers: Vec<(DeviceId, mpsc::Sender<LiveFrame>)>,
    delivered: HashMap<DeviceId, Timestamp>,
}

impl TableRecord {
    fn undelivered(&self, device: &DeviceId) -> usize {
        let cursor = self.delivered.get(device).copied().unwrap_or_default();
        self.entries
            .values()
            .filter(|s| s.uploader != *device && s.entry.uploaded > cursor)
            .count()
    }

    fn mark_delivered(&mut self, device: DeviceId, upto: Timestamp) {
        let cursor = self.delivered.entry(device).or_default();
        if upto > *cursor {
            *cursor = upto;
        }
    }
}

#[derive(Debug, Default)]
struct MockBackendInner {
    clock: u64,
    tables: HashMap<String, TableRecord>,
    devices: BTreeMap<DeviceId, DeviceRecord>,
    quota: Option<usize>,
    reject_auth: bool,
    account_deleted: bool,
    fail_downloads: usize,
    fail_uploads: usize,
    fail_subscribes: usize,
    latency: Option<Duration>,
    download_calls: usize,
    upload_calls: usize,
    subscribe_calls: usize,
}

impl MockBackendInner {
    fn check_auth(&self, auth: &Auth) -> Result<(), BackendError> {
        if self.reject_auth || auth.bearer.is_empty() {
            return Err(BackendError::Unauthenticated);
        }
        if self.account_deleted {
            return Err(BackendError::Rejected("account deleted".into()));
        }
        Ok(())
    }

    fn table(&mut self, table: &str) -> &mut TableRecord {
        self.tables.entry(table.to_string()).or_default()
    }
}

fn take_failure(counter: &mut usize, what: &str) -> Result<(), BackendError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(BackendError::Unavailable(format!("injected {} failure", what)));
    }
    Ok(())
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit on changes not yet delivered to some other device.
    pub fn set_quota(&self, limit: Option<usize>) {
        self.inner.lock().unwrap().quota = limit;
    }

    /// Reject every credential.
    pub fn set_reject_auth(&self, reject: bool) {
        self.inner.lock().unwrap().reject_auth = reject;
    }

    /// Fail the next `n` downloads with a transient error.
    pub fn fail_next_downloads(&self, n: usize) {
        self.inner.lock().unwrap().fail_downloads = n;
    }

    /// Fail the next `n` uploads with a transient error.
    pub fn fail_next_uploads(&self, n: usize) {
        self.inner.lock().unwrap().fail_uploads = n;
    }

    /// Fail the next `n` subscriptions with a transient error.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.lock().unwrap().fail_subscribes = n;
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().unwrap().latency = latency;
    }

    /// Make downloads of `table` declare `version` instead of the real key version.
    pub fn declare_key_version(&self, table: &str, version: Option<KeyVersion>) {
        self.inner.lock().unwrap().table(table).declared_key_version = version;
    }

    /// Close every live stream of `table` with an explicit reason.
    pub fn close_live(&self, table: &str, reason: CloseReason) {
        let mut inner = self.inner.lock().unwrap();
        for (_, sender) in inner.table(table).subscribers.drain(..) {
            let _ = sender.try_send(LiveFrame::Closed(reason.clone()));
        }
    }

    /// Drop every live stream of `table` without a reason (a network blip).
    pub fn drop_live(&self, table: &str) {
        self.inner.lock().unwrap().table(table).subscribers.clear();
    }

    /// Push raw bytes to every live subscriber of `table`.
    pub fn inject_live_bytes(&self, table: &str, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        for (_, sender) in &inner.table(table).subscribers {
            let _ = sender.try_send(LiveFrame::Data(bytes.clone()));
        }
    }

    /// The entry stored for `table`/`key`.
    pub fn stored(&self, table: &str, key: &str) -> Option<EncryptedEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(table)
            .and_then(|t| t.entries.get(key))
            .map(|s| s.entry.clone())
    }

    /// Number of keys stored for `table`.
    pub fn entry_count(&self, table: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(table).map_or(0, |t| t.entries.len())
    }

    /// Open live streams on `table`.
    pub fn subscriber_count(&self, table: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(table).map_or(0, |t| {
            t.subscribers.iter().filter(|(_, s)| !s.is_closed()).count()
        })
    }

    /// Calls made so far: (downloads, uploads, subscribes).
    pub fn call_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.download_calls, inner.upload_calls, inner.subscribe_calls)
    }

    /// The registered record of `device_id`.
    pub fn device(&self, device_id: &DeviceId) -> Option<DeviceRecord> {
        self.inner.lock().unwrap().devices.get(device_id).cloned()
    }

    async fn delay(&self) {
        let latency = self.inner.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Clone for MockBackend {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn download(
        &self,
        auth: &Auth,
        table: &str,
        since: Timestamp,
        limit: usize,
    ) -> Result<DownloadBatch, BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        inner.download_calls += 1;
        take_failure(&mut inner.fail_downloads, "download")?;

        let record = inner.table(table);
        let mut newer: Vec<&StoredEntry> = record
            .entries
            .values()
            .filter(|s| s.entry.uploaded > since)
            .collect();
        newer.sort_by_key(|s| s.entry.uploaded);
        let has_more = newer.len() > limit;
        let entries: Vec<EncryptedEntry> =
            newer.into_iter().take(limit).map(|s| s.entry.clone()).collect();

        if let Some(last) = entries.last() {
            let upto = last.uploaded;
            record.mark_delivered(auth.device_id, upto);
        }
        Ok(DownloadBatch {
            table_key_version: record.declared_key_version.unwrap_or(record.key_version),
            entries,
            has_more,
        })
    }

    async fn upload(
        &self,
        auth: &Auth,
        table: &str,
        entries: Vec<EncryptedEntry>,
    ) -> Result<Vec<UploadReceipt>, BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        inner.upload_calls += 1;
        take_failure(&mut inner.fail_uploads, "upload")?;

        let quota = inner.quota;
        let others: Vec<DeviceId> = inner
            .devices
            .keys()
            .filter(|d| **d != auth.device_id)
            .copied()
            .collect();
        let MockBackendInner { clock, tables, .. } = &mut *inner;
        let record = tables.entry(table.to_string()).or_default();

        if let Some(limit) = quota {
            for device in &others {
                let pending = record.undelivered(device) + entries.len();
                if pending > limit {
                    return Err(BackendError::QuotaExceeded { pending, limit });
                }
            }
        }
        if let Some(bad) = entries
            .iter()
            .find(|e| !e.key_version.is_some() || e.key_version > record.key_version)
        {
            return Err(BackendError::Rejected(format!(
                "unknown key version {} for {}",
                bad.key_version, bad.key
            )));
        }

        let mut receipts = Vec::with_capacity(entries.len());
        let mut pushed = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let current = record.entries.get(&entry.key).map_or(0, |s| s.entry.version);
            *clock += 1;
            let uploaded = Timestamp::new(*clock);

            receipts.push(UploadReceipt {
                local_version: entry.version,
                assigned_version: current + 1,
                uploaded,
            });
            entry.version = current + 1;
            entry.uploaded = uploaded;
            pushed.push(entry.clone());
            record.entries.insert(
                entry.key.clone(),
                StoredEntry {
                    entry,
                    uploader: auth.device_id,
                },
            );
        }

        let message = LiveMessage::Changes {
            table: table.to_string(),
            entries: pushed,
        };
        if let (Ok(bytes), LiveMessage::Changes { entries, .. }) = (message.to_bytes(), &message) {
            record.subscribers.retain(|(_, s)| !s.is_closed());
            let mut reached = Vec::new();
            for (device, sender) in &record.subscribers {
                if *device != auth.device_id
                    && sender.try_send(LiveFrame::Data(bytes.clone())).is_ok()
                {
                    reached.push(*device);
                }
            }
            if let Some(last) = entries.last() {
                for device in reached {
                    record.mark_delivered(device, last.uploaded);
                }
            }
        }

        Ok(receipts)
    }

    async fn subscribe(
        &self,
        auth: &Auth,
        table: &str,
        _since: Timestamp,
    ) -> Result<mpsc::Receiver<LiveFrame>, BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        inner.subscribe_calls += 1;
        take_failure(&mut inner.fail_subscribes, "subscribe")?;

        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        inner.table(table).subscribers.push((auth.device_id, tx));
        Ok(rx)
    }

    async fn devices(&self, auth: &Auth) -> Result<Vec<DeviceRecord>, BackendError> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        Ok(inner.devices.values().cloned().collect())
    }

    async fn register_device(
        &self,
        auth: &Auth,
        record: DeviceRecord,
    ) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        inner.devices.insert(record.device_id, record);
        Ok(())
    }

    async fn remove_device(&self, auth: &Auth, device_id: DeviceId) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        if inner.devices.remove(&device_id).is_none() {
            return Err(BackendError::NotFound(format!("device {}", device_id)));
        }
        for record in inner.tables.values_mut() {
            record.wrapped.retain(|w| w.device_id != device_id);
            record.subscribers.retain(|(d, _)| *d != device_id);
            record.delivered.remove(&device_id);
        }
        Ok(())
    }

    async fn key_version(&self, auth: &Auth, table: &str) -> Result<KeyVersion, BackendError> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        Ok(inner.tables.get(table).map(|t| t.key_version).unwrap_or_default())
    }

    async fn publish_key(
        &self,
        auth: &Auth,
        table: &str,
        expected: KeyVersion,
        wrapped: Vec<WrappedKey>,
    ) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        let record = inner.table(table);
        if record.key_version != expected {
            return Err(BackendError::Conflict {
                current: record.key_version,
            });
        }
        let next = expected.next();
        if wrapped.is_empty() || wrapped.iter().any(|w| w.key_version != next || w.table != table) {
            return Err(BackendError::Rejected(format!(
                "wrapped keys must all be {} of {}",
                next, table
            )));
        }
        record.key_version = next;
        record.wrapped.extend(wrapped);
        Ok(())
    }

    async fn fetch_keys(
        &self,
        auth: &Auth,
        table: &str,
        device_id: DeviceId,
    ) -> Result<Vec<WrappedKey>, BackendError> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        Ok(inner
            .tables
            .get(table)
            .map(|t| {
                t.wrapped
                    .iter()
                    .filter(|w| w.device_id == device_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn acknowledge_key(
        &self,
        auth: &Auth,
        table: &str,
        device_id: DeviceId,
        key_version: KeyVersion,
    ) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        let device = inner
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| BackendError::NotFound(format!("device {}", device_id)))?;
        let seen = device
            .last_seen_key_version
            .entry(table.to_string())
            .or_default();
        if key_version > *seen {
            *seen = key_version;
        }
        Ok(())
    }

    async fn delete_account(&self, auth: &Auth) -> Result<(), BackendError> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.check_auth(auth)?;
        for record in inner.tables.values_mut() {
            for (_, sender) in record.subscribers.drain(..) {
                let _ = sender.try_send(LiveFrame::Closed(CloseReason::AccountDeleted));
            }
        }
        inner.tables.clear();
        inner.devices.clear();
        inner.account_deleted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(device_id: DeviceId) -> Auth {
        Auth {
            bearer: "token".into(),
            device_id,
        }
    }

    fn entry(key: &str, key_version: u32) -> EncryptedEntry {
        EncryptedEntry {
            table: "notes".into(),
            key: key.into(),
            version: 1,
            key_version: KeyVersion::new(key_version),
            nonce: [0u8; 24],
            ciphertext: vec![1, 2, 3],
            deleted: false,
            uploaded: Timestamp::zero(),
        }
    }

    async fn backend_with_key(device: DeviceId) -> MockBackend {
        let backend = MockBackend::new();
        let auth = auth(device);
        backend
            .register_device(&auth, DeviceRecord::new(device, "a", [9u8; 32]))
            .await
            .unwrap();
        let wrapped = WrappedKey {
            table: "notes".into(),
            key_version: KeyVersion::new(1),
            device_id: device,
            ephemeral_public: [0u8; 32],
            nonce: [0u8; 24],
            sealed: vec![],
        };
        backend
            .publish_key(&auth, "notes", KeyVersion::NONE, vec![wrapped])
            .await
            .unwrap();
        backend
    }

    // ===========================================
    // MockBackend Change Tests
    // ===========================================

    #[tokio::test]
    async fn upload_assigns_versions_and_timestamps() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        let auth = auth(device);

        let first = backend.upload(&auth, "notes", vec![entry("k1", 1)]).await.unwrap();
        let second = backend.upload(&auth, "notes", vec![entry("k1", 1)]).await.unwrap();
        assert_eq!(first[0].assigned_version, 1);
        assert_eq!(second[0].assigned_version, 2);
        assert!(second[0].uploaded > first[0].uploaded);
        assert_eq!(backend.stored("notes", "k1").unwrap().version, 2);
    }

    #[tokio::test]
    async fn download_pages_by_timestamp() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        let auth = auth(device);
        backend
            .upload(&auth, "notes", vec![entry("a", 1), entry("b", 1), entry("c", 1)])
            .await
            .unwrap();

        let page = backend.download(&auth, "notes", Timestamp::zero(), 2).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.has_more);
        let rest = backend
            .download(&auth, "notes", page.entries[1].uploaded, 2)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(!rest.has_more);
        assert_eq!(rest.table_key_version, KeyVersion::new(1));
    }

    #[tokio::test]
    async fn unknown_key_version_is_rejected() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        let result = backend.upload(&auth(device), "notes", vec![entry("k", 2)]).await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
    }

    #[tokio::test]
    async fn quota_counts_undelivered_changes() {
        let a = DeviceId::random();
        let b = DeviceId::random();
        let backend = backend_with_key(a).await;
        backend
            .register_device(&auth(a), DeviceRecord::new(b, "b", [8u8; 32]))
            .await
            .unwrap();
        backend.set_quota(Some(2));

        backend
            .upload(&auth(a), "notes", vec![entry("k1", 1), entry("k2", 1)])
            .await
            .unwrap();
        let result = backend.upload(&auth(a), "notes", vec![entry("k3", 1)]).await;
        assert!(matches!(result, Err(BackendError::QuotaExceeded { .. })));

        // Device b catching up frees the budget
        backend
            .download(&auth(b), "notes", Timestamp::zero(), 100)
            .await
            .unwrap();
        backend.upload(&auth(a), "notes", vec![entry("k3", 1)]).await.unwrap();
    }

    // ===========================================
    // MockBackend Key Tests
    // ===========================================

    #[tokio::test]
    async fn publish_is_compare_and_set() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        let wrapped = WrappedKey {
            table: "notes".into(),
            key_version: KeyVersion::new(1),
            device_id: device,
            ephemeral_public: [0u8; 32],
            nonce: [0u8; 24],
            sealed: vec![],
        };
        let result = backend
            .publish_key(&auth(device), "notes", KeyVersion::NONE, vec![wrapped])
            .await;
        assert_eq!(
            result,
            Err(BackendError::Conflict {
                current: KeyVersion::new(1)
            })
        );
    }

    #[tokio::test]
    async fn acknowledge_updates_device_record() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        backend
            .acknowledge_key(&auth(device), "notes", device, KeyVersion::new(1))
            .await
            .unwrap();
        assert_eq!(backend.device(&device).unwrap().seen("notes"), KeyVersion::new(1));
    }

    // ===========================================
    // MockBackend Live and Fault Tests
    // ===========================================

    #[tokio::test]
    async fn uploads_are_pushed_to_other_subscribers() {
        let a = DeviceId::random();
        let b = DeviceId::random();
        let backend = backend_with_key(a).await;
        let mut own = backend.subscribe(&auth(a), "notes", Timestamp::zero()).await.unwrap();
        let mut other = backend.subscribe(&auth(b), "notes", Timestamp::zero()).await.unwrap();

        backend.upload(&auth(a), "notes", vec![entry("k1", 1)]).await.unwrap();

        match other.recv().await.unwrap() {
            LiveFrame::Data(bytes) => match LiveMessage::from_bytes(&bytes).unwrap() {
                LiveMessage::Changes { entries, .. } => assert_eq!(entries[0].key, "k1"),
                unexpected => panic!("unexpected message {:?}", unexpected),
            },
            unexpected => panic!("unexpected frame {:?}", unexpected),
        }
        assert!(own.try_recv().is_err());

        backend.close_live("notes", CloseReason::TableDeleted);
        assert_eq!(own.recv().await, Some(LiveFrame::Closed(CloseReason::TableDeleted)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let device = DeviceId::random();
        let backend = backend_with_key(device).await;
        backend.fail_next_downloads(1);
        let auth = auth(device);
        assert!(matches!(
            backend.download(&auth, "notes", Timestamp::zero(), 10).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(backend.download(&auth, "notes", Timestamp::zero(), 10).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let backend = MockBackend::new();
        backend.set_reject_auth(true);
        let result = backend.devices(&auth(DeviceId::random())).await;
        assert_eq!(result, Err(BackendError::Unauthenticated));
    }
}
