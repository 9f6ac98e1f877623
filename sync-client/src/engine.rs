//! SyncEngine - the main interface for tablesync.
//!
//! This module provides [`SyncEngine`], which owns one guarded state machine
//! per registered table and drives the change log, key manager and remote
//! connector through batched and live sync.
//!
//! # Architecture
//!
//! The engine uses pure state machines from sync-core ([`TableState`] for the
//! caller-visible state, [`ConnectorState`] for the protocol) and interprets
//! their actions to perform the actual I/O.
//!
//! ```text
//! Application → SyncEngine → ChangeLog  → SQLite
//!                   ↓      → KeyManager → RemoteConnector → RemoteBackend
//!              sync-core (pure state machines)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tablesync_client::{EngineConfig, MockBackend, StaticSession, SyncEngine, X25519KeyPair};
//!
//! let engine = SyncEngine::open(
//!     EngineConfig::default(),
//!     MockBackend::new(),
//!     Arc::new(StaticSession::new("token")),
//!     Arc::new(X25519KeyPair::from_secret_bytes(secret)),
//! )
//! .await?;
//! engine.register(AccountId::new(), RemoteEndpoint::new("https://sync.example.com"), "laptop").await?;
//! engine.register_table("notes").await?;
//! engine.write("notes", "k1", b"hello").await?;
//! engine.resync("notes").await?;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use tablesync_core::{
    aggregate_status, Action, BundleKey, ConnectorEvent, ConnectorPolicy, ConnectorState,
    Disconnect, IdentityPayload, Notice, RemoteEndpoint, RotationProgress, StatusEvent,
    TableError, TableEvent, TableState,
};
use tablesync_types::{AccountId, DeviceId, DeviceRecord, ErrorKind, KeyVersion, UploadReceipt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use zeroize::Zeroizing;

use crate::changelog::{ApplyResult, ChangeLog, ChangeNotice};
use crate::config::EngineConfig;
use crate::crypto::{Argon2Params, DeviceKeyPair, TableKey};
use crate::error::EngineError;
use crate::exchange::{open_payload, seal_payload, ExchangeError, Identity, ImportedIdentity};
use crate::keys::{keystore_owner, purge_keystore, KeyManager, RotationTicket};
use crate::remote::{LiveFrame, RemoteBackend, RemoteConnector, SessionProvider};
use crate::session::{cancelled, SyncSession};
use crate::store::{LocalStore, StoreError, TableMetadata};

const STATUS_CHANNEL_CAPACITY: usize = 256;

const KIND_DEVICE: &str = "device";
const KIND_IDENTITY: &str = "identity";
const KIND_TABLE: &str = "table";
const SELF_ROW: &str = "self";

const DEFAULT_DEVICE_NAME: &str = "tablesync device";

struct TableSlot {
    state: TableState,
    cancel: watch::Sender<bool>,
    live: Option<mpsc::Sender<()>>,
}

impl TableSlot {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state: TableState::Idle,
            cancel,
            live: None,
        }
    }
}

struct Inner<B> {
    config: EngineConfig,
    policy: ConnectorPolicy,
    store: LocalStore,
    changes: ChangeLog,
    keys: KeyManager<B>,
    remote: RemoteConnector<B>,
    device_id: DeviceId,
    tables: DashMap<String, TableSlot>,
    sessions: DashMap<String, ConnectorState>,
    events: broadcast::Sender<StatusEvent>,
    rotation_guard: Mutex<()>,
    export_guard: Mutex<()>,
    import_guard: Mutex<()>,
}

/// What woke the live task.
enum Wake {
    Frame(Option<LiveFrame>),
    Local,
    Cancelled,
}

/// The sync engine for one device.
///
/// Cloning shares the engine. Every table runs at most one sync operation at
/// a time; different tables synchronize in parallel.
pub struct SyncEngine<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for SyncEngine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: RemoteBackend> SyncEngine<B> {
    /// Open the engine over the database named in `config.storage`.
    pub async fn open(
        config: EngineConfig,
        backend: B,
        session: Arc<dyn SessionProvider>,
        keypair: Arc<dyn DeviceKeyPair>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let store = LocalStore::open(&config.storage.database).await?;
        Self::with_store(config, store, backend, session, keypair).await
    }

    /// Open the engine over an already opened store.
    pub async fn with_store(
        config: EngineConfig,
        store: LocalStore,
        backend: B,
        session: Arc<dyn SessionProvider>,
        keypair: Arc<dyn DeviceKeyPair>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let device_id = load_device_id(&store).await?;

        let (notice_tx, notice_rx) = mpsc::channel(config.sync.change_queue_capacity);
        let changes = ChangeLog::with_notices(store.clone(), notice_tx);
        let remote = RemoteConnector::new(
            Arc::new(backend),
            session,
            device_id,
            config.request_timeout(),
        );
        let keys = KeyManager::new(store.clone(), remote.clone(), keypair);

        let tables = DashMap::new();
        for table in load_registrations(&store).await? {
            changes.register_table(&table).await?;
            tables.insert(table, TableSlot::new());
        }

        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            policy: config.connector_policy(),
            config,
            store,
            changes,
            keys,
            remote,
            device_id,
            tables,
            sessions: DashMap::new(),
            events,
            rotation_guard: Mutex::new(()),
            export_guard: Mutex::new(()),
            import_guard: Mutex::new(()),
        });
        spawn_dispatcher(Arc::downgrade(&inner), notice_rx);

        tracing::debug!(
            "engine opened for device {} with {} table(s)",
            device_id,
            inner.tables.len()
        );
        Ok(Self { inner })
    }

    /// This device's id.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// The local store.
    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// Registered table names.
    pub fn tables(&self) -> Vec<String> {
        self.inner.tables.iter().map(|e| e.key().clone()).collect()
    }

    // ===== Tables and Data =====

    /// Start tracking `table`. Registering twice is a no-op.
    ///
    /// Rows already present in the table are recorded as pending.
    pub async fn register_table(&self, table: &str) -> Result<(), EngineError> {
        self.inner.changes.register_table(table).await?;
        self.inner
            .store
            .put_system(KIND_TABLE, table, 0, &())
            .await?;
        self.inner
            .tables
            .entry(table.to_string())
            .or_insert_with(TableSlot::new);
        Ok(())
    }

    /// Stop tracking `table`, cancelling any in-flight work.
    ///
    /// Rows and change bookkeeping stay on disk; registering the table again
    /// picks up where it left off.
    pub async fn unregister_table(&self, table: &str) -> Result<(), EngineError> {
        let (_, slot) = self
            .inner
            .tables
            .remove(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
        slot.cancel.send_replace(true);
        self.inner.sessions.remove(table);
        self.inner
            .store
            .delete_system(KIND_TABLE, Some(table))
            .await?;
        tracing::info!("{}: unregistered", table);
        Ok(())
    }

    fn check_table(&self, table: &str) -> Result<(), EngineError> {
        if self.inner.tables.contains_key(table) {
            Ok(())
        } else {
            Err(EngineError::UnknownTable(table.to_string()))
        }
    }

    /// Insert or replace a row. Returns the new local version.
    pub async fn write(&self, table: &str, key: &str, payload: &[u8]) -> Result<u64, EngineError> {
        self.check_table(table)?;
        Ok(self.inner.changes.write(table, key, payload).await?)
    }

    /// Delete a row. Returns the new local version.
    pub async fn delete(&self, table: &str, key: &str) -> Result<u64, EngineError> {
        self.check_table(table)?;
        Ok(self.inner.changes.delete(table, key).await?)
    }

    /// Read a row.
    pub async fn read(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.check_table(table)?;
        Ok(self.inner.changes.read(table, key).await?)
    }

    /// Number of local changes waiting for upload.
    pub async fn pending_count(&self, table: &str) -> Result<u64, EngineError> {
        self.check_table(table)?;
        Ok(self.inner.changes.pending_count(table).await?)
    }

    // ===== Status =====

    /// Current state of `table`.
    pub fn status(&self, table: &str) -> Result<TableState, EngineError> {
        self.inner
            .tables
            .get(table)
            .map(|slot| slot.state.clone())
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))
    }

    /// Worst state across all tables.
    pub fn aggregate_status(&self) -> TableState {
        let states: Vec<TableState> = self
            .inner
            .tables
            .iter()
            .map(|slot| slot.state.clone())
            .collect();
        aggregate_status(states.iter())
    }

    /// Receive status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Protocol state of the table's running session, if one is running.
    pub fn session_state(&self, table: &str) -> Option<ConnectorState> {
        self.inner.sessions.get(table).map(|s| s.value().clone())
    }

    fn emit(&self, event: StatusEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn report(&self, table: Option<&str>, key: Option<&str>, kind: ErrorKind, message: String) {
        tracing::warn!(
            "{}: {:?} error: {}",
            table.unwrap_or("engine"),
            kind,
            message
        );
        self.emit(StatusEvent::Error {
            table: table.map(str::to_string),
            key: key.map(str::to_string),
            kind,
            message,
        });
    }

    fn state_changed(&self, table: &str, state: TableState) {
        tracing::debug!("{}: state -> {:?}", table, state);
        self.emit(StatusEvent::StateChanged {
            table: table.to_string(),
            state,
        });
    }

    /// Apply a caller-requested transition.
    fn transition(
        &self,
        table: &str,
        event: TableEvent,
        on_applied: impl FnOnce(&mut TableSlot),
    ) -> Result<TableState, EngineError> {
        let next = {
            let mut slot = self
                .inner
                .tables
                .get_mut(table)
                .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
            let next = slot.state.clone().apply(event)?;
            slot.state = next.clone();
            on_applied(&mut *slot);
            next
        };
        self.state_changed(table, next.clone());
        Ok(next)
    }

    /// Apply a transition on behalf of a running operation, unless that
    /// operation was cancelled in the meantime.
    fn settle(
        &self,
        table: &str,
        cancel: &watch::Receiver<bool>,
        event: TableEvent,
        on_applied: impl FnOnce(&mut TableSlot),
    ) -> Option<TableState> {
        let next = {
            let mut slot = self.inner.tables.get_mut(table)?;
            if *cancel.borrow() {
                return None;
            }
            match slot.state.clone().apply(event) {
                Ok(next) => {
                    slot.state = next.clone();
                    on_applied(&mut *slot);
                    next
                }
                Err(e) => {
                    tracing::debug!("{}: {}", table, e);
                    return None;
                }
            }
        };
        self.state_changed(table, next.clone());
        Some(next)
    }

    fn fail_table(&self, table: &str, cancel: &watch::Receiver<bool>, error: &EngineError) {
        if *cancel.borrow() {
            tracing::debug!("{}: ignoring failure after cancellation: {}", table, error);
            return;
        }
        let failure = TableError::new(error.kind(), error.to_string());
        self.settle(table, cancel, TableEvent::Failed(failure), |slot| {
            slot.live = None;
        });
        self.report(Some(table), error.key(), error.kind(), error.to_string());
    }

    // ===== Sync Control =====

    /// Check-and-set `Idle → Syncing`, handing out a fresh cancel signal.
    fn begin(&self, table: &str) -> Result<watch::Receiver<bool>, EngineError> {
        let cancel = {
            let mut slot = self
                .inner
                .tables
                .get_mut(table)
                .ok_or_else(|| EngineError::UnknownTable(table.to_string()))?;
            if slot.state != TableState::Idle {
                return Err(EngineError::AlreadySynchronizing {
                    table: table.to_string(),
                });
            }
            slot.state = TableState::Syncing;
            let (tx, rx) = watch::channel(false);
            slot.cancel = tx;
            rx
        };
        self.state_changed(table, TableState::Syncing);
        Ok(cancel)
    }

    /// Run a full sync pass for `table`.
    ///
    /// Stays in live mode afterwards when `sync.live_by_default` is set.
    pub async fn resync(&self, table: &str) -> Result<(), EngineError> {
        let cancel = self.begin(table)?;
        self.run_sync(table, cancel, self.inner.config.sync.live_by_default)
            .await
    }

    /// Run a full sync pass and hold `table` in live mode.
    pub async fn enable_live(&self, table: &str) -> Result<(), EngineError> {
        let cancel = self.begin(table)?;
        self.run_sync(table, cancel, true).await
    }

    /// Leave live mode, returning `table` to `Idle`.
    pub fn stop_live(&self, table: &str) -> Result<(), EngineError> {
        self.transition(table, TableEvent::LiveStopped, |slot| {
            slot.cancel.send_replace(true);
            slot.live = None;
        })?;
        self.inner.sessions.remove(table);
        tracing::info!("{}: live sync stopped", table);
        Ok(())
    }

    /// Disable `table`, cancelling any in-flight work.
    pub fn disable(&self, table: &str) -> Result<(), EngineError> {
        self.transition(table, TableEvent::Disable, |slot| {
            slot.cancel.send_replace(true);
            slot.live = None;
        })?;
        self.inner.sessions.remove(table);
        tracing::info!("{}: disabled", table);
        Ok(())
    }

    /// Re-enable a disabled table.
    pub fn enable(&self, table: &str) -> Result<(), EngineError> {
        self.transition(table, TableEvent::Enable, |_| {})?;
        Ok(())
    }

    /// Clear a table's error and resync it.
    pub async fn retry(&self, table: &str) -> Result<(), EngineError> {
        self.transition(table, TableEvent::ClearError, |_| {})?;
        self.resync(table).await
    }

    fn step(&self, session: &mut SyncSession, event: ConnectorEvent) -> Vec<Action> {
        let actions = session.handle(event);
        self.inner
            .sessions
            .insert(session.table().to_string(), session.state().clone());
        actions
    }

    fn end_session(&self, table: &str) {
        self.inner.sessions.remove(table);
    }

    async fn cancellable<T>(
        &self,
        table: &str,
        cancel: &watch::Receiver<bool>,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::select! {
            result = work => result,
            _ = cancelled(cancel.clone()) => Err(EngineError::Cancelled(table.to_string())),
        }
    }

    async fn run_sync(
        &self,
        table: &str,
        cancel: watch::Receiver<bool>,
        live: bool,
    ) -> Result<(), EngineError> {
        tracing::info!("{}: sync started", table);
        let mut session = SyncSession::new(table, self.inner.policy, cancel.clone());
        self.step(&mut session, ConnectorEvent::SyncRequested);

        let mut result = self
            .cancellable(table, &cancel, self.sync_pass(&mut session))
            .await;
        if matches!(&result, Err(e) if e.is_system_corruption()) {
            self.step(&mut session, ConnectorEvent::PassFailed);
            result = match self.recover_system_table().await {
                Ok(()) => {
                    self.step(&mut session, ConnectorEvent::SyncRequested);
                    self.cancellable(table, &cancel, self.sync_pass(&mut session))
                        .await
                }
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(()) if live => {
                let (local_tx, local_rx) = mpsc::channel(1);
                let entered = self.settle(
                    table,
                    &cancel,
                    TableEvent::SyncSucceeded { live: true },
                    |slot| slot.live = Some(local_tx),
                );
                if entered.is_some() {
                    tracing::info!("{}: sync finished, going live", table);
                    tokio::spawn(self.clone().run_live(session, local_rx));
                } else {
                    self.end_session(table);
                }
                Ok(())
            }
            Ok(()) => {
                self.step(&mut session, ConnectorEvent::UploadFinished { live: false });
                self.end_session(table);
                self.settle(table, &cancel, TableEvent::SyncSucceeded { live: false }, |_| {});
                tracing::info!("{}: sync finished", table);
                Ok(())
            }
            Err(e) => {
                if matches!(
                    session.state(),
                    ConnectorState::Downloading | ConnectorState::Uploading
                ) {
                    self.step(&mut session, ConnectorEvent::PassFailed);
                }
                self.end_session(table);
                if !matches!(e, EngineError::Cancelled(_)) {
                    self.fail_table(table, &cancel, &e);
                }
                Err(e)
            }
        }
    }

    /// Download, apply, upload.
    async fn sync_pass(&self, session: &mut SyncSession) -> Result<(), EngineError> {
        let table = session.table().to_string();
        let table = table.as_str();

        {
            let _guard = self.inner.rotation_guard.lock().await;
            let active = self.inner.keys.ensure_table_key(table).await?;
            if self.inner.keys.pending_rotation(table).await?.is_some() {
                let after = self.inner.keys.reconcile_quorum(table).await?;
                self.announce_activation(table, active, after);
            }
        }
        let (mut meta, _) = self.table_metadata(table).await?;
        let applied = self.download(table, &mut meta).await?;
        self.step(session, ConnectorEvent::DownloadFinished);
        let uploaded = self.upload_pending(table).await?;

        meta.active_key_version = self.inner.keys.active_version(table).await?;
        self.inner.store.save_metadata(&meta).await?;
        tracing::debug!(
            "{}: applied {} remote change(s), uploaded {}",
            table,
            applied,
            uploaded
        );
        Ok(())
    }

    /// Load `table`'s metadata, rebuilding it when corrupted.
    ///
    /// The flag tells whether a reset happened; `last_sync` is zero then.
    async fn table_metadata(&self, table: &str) -> Result<(TableMetadata, bool), EngineError> {
        match self.inner.store.load_metadata(table).await {
            Ok(meta) => Ok((meta, false)),
            Err(StoreError::CorruptedMetadata { reason, .. }) => {
                self.report(
                    Some(table),
                    None,
                    ErrorKind::LocalCorruption,
                    format!("metadata corrupted ({}), resyncing from scratch", reason),
                );
                let active = self.inner.keys.active_version(table).await?;
                Ok((self.inner.store.reset_metadata(table, active).await?, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Page through remote changes newer than `meta.last_sync`.
    async fn download(&self, table: &str, meta: &mut TableMetadata) -> Result<usize, EngineError> {
        let limit = self.inner.config.sync.batch_size;
        let mut applied = 0;
        loop {
            let expected = self.inner.keys.active_version(table).await?;
            let batch = self
                .inner
                .remote
                .download(table, meta.last_sync, limit, expected)
                .await?;
            if batch.table_key_version > self.inner.keys.latest_known(table).await? {
                self.refresh(table).await?;
            }
            if batch.entries.is_empty() {
                break;
            }

            let opened = self.inner.keys.decrypt_batch(table, &batch.entries).await?;
            let result = self.inner.changes.apply_remote_changes(table, &opened).await?;
            applied += result.applied;
            if let Some(newest) = batch.entries.iter().map(|e| e.uploaded).max() {
                meta.last_sync = meta.last_sync.max(newest);
            }
            self.inner.store.save_metadata(meta).await?;

            if !batch.has_more {
                break;
            }
        }
        Ok(applied)
    }

    /// Upload pending changes batch by batch.
    async fn upload_pending(&self, table: &str) -> Result<usize, EngineError> {
        let limit = self.inner.config.sync.batch_size;
        let mut uploaded = 0;
        loop {
            let batch = self.inner.changes.next_pending_batch(table, limit).await?;
            if batch.is_empty() {
                break;
            }
            let sealed = self.inner.keys.encrypt_batch(table, &batch).await?;
            let receipts = self.inner.remote.upload(table, sealed).await?;
            let acknowledged: Vec<(String, UploadReceipt)> =
                batch.into_iter().map(|entry| entry.key).zip(receipts).collect();
            uploaded += acknowledged.len();
            let trimmed = self
                .inner
                .changes
                .mark_uploaded(table, &acknowledged)
                .await?;
            if trimmed == 0 {
                // Everything was rewritten mid-upload; the next pass takes it
                break;
            }
        }
        Ok(uploaded)
    }

    /// Purge the keystore, refetch keys and force a full resync of every table.
    async fn recover_system_table(&self) -> Result<(), EngineError> {
        self.report(
            None,
            None,
            ErrorKind::LocalCorruption,
            "system table corrupted, refetching keys and resyncing every table".into(),
        );
        let _guard = self.inner.rotation_guard.lock().await;
        self.inner.keys.purge().await?;
        for table in self.tables() {
            self.inner.store.reset_metadata(&table, KeyVersion::NONE).await?;
            self.inner.keys.refresh_keys(&table).await?;
        }
        Ok(())
    }

    // ===== Live Sync =====

    async fn run_live(self, mut session: SyncSession, mut local_rx: mpsc::Receiver<()>) {
        let table = session.table().to_string();
        let table = table.as_str();
        let cancel = session.cancel_handle();
        let mut frames: Option<mpsc::Receiver<LiveFrame>> = None;
        let mut disable_kind = ErrorKind::NetworkUnrecoverable;
        let mut queue: VecDeque<Action> = self
            .step(&mut session, ConnectorEvent::UploadFinished { live: true })
            .into();

        loop {
            let mut ended = false;
            while let Some(action) = queue.pop_front() {
                if *cancel.borrow() {
                    self.end_session(table);
                    return;
                }
                let event = match action {
                    Action::Subscribe => match self.subscribe_live(table, &cancel).await {
                        Ok(rx) => {
                            frames = Some(rx);
                            Some(ConnectorEvent::LiveEstablished)
                        }
                        Err(e) => match self.live_failed(table, &cancel, e, &mut disable_kind) {
                            Some(event) => Some(event),
                            None => return,
                        },
                    },
                    Action::Download | Action::CatchUp => {
                        match self
                            .cancellable(table, &cancel, self.catch_up(table))
                            .await
                        {
                            Ok(()) => Some(ConnectorEvent::CaughtUp),
                            Err(e) => match self.live_failed(table, &cancel, e, &mut disable_kind)
                            {
                                Some(event) => Some(event),
                                None => return,
                            },
                        }
                    }
                    Action::Upload => {
                        match self
                            .cancellable(table, &cancel, self.upload_pending(table))
                            .await
                        {
                            Ok(_) => None,
                            Err(e) => match self.live_failed(table, &cancel, e, &mut disable_kind)
                            {
                                Some(event) => Some(event),
                                None => return,
                            },
                        }
                    }
                    Action::StartReconnectTimer { delay } => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => Some(ConnectorEvent::ReconnectTimer),
                            _ = cancelled(cancel.clone()) => {
                                self.end_session(table);
                                return;
                            }
                        }
                    }
                    Action::Unsubscribe | Action::CancelInFlight => {
                        frames = None;
                        None
                    }
                    Action::EndSession => {
                        ended = true;
                        None
                    }
                    Action::Emit(notice) => {
                        self.live_notice(table, &cancel, notice, disable_kind);
                        None
                    }
                };
                if let Some(event) = event {
                    queue.extend(self.step(&mut session, event));
                }
            }

            if ended {
                self.end_session(table);
                return;
            }
            let Some(rx) = frames.as_mut() else {
                self.end_session(table);
                return;
            };

            let wake = tokio::select! {
                frame = rx.recv() => Wake::Frame(frame),
                Some(()) = local_rx.recv() => Wake::Local,
                _ = cancelled(cancel.clone()) => Wake::Cancelled,
            };
            let event = match wake {
                Wake::Frame(Some(LiveFrame::Data(bytes))) => {
                    match self.apply_live(table, &bytes).await {
                        Ok(result) => {
                            if result.applied > 0 {
                                tracing::debug!("{}: applied {} pushed change(s)", table, result.applied);
                            }
                            Some(ConnectorEvent::LiveDataApplied)
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::Protocol | ErrorKind::KeyState | ErrorKind::Input
                            ) =>
                        {
                            disable_kind = ErrorKind::Protocol;
                            Some(ConnectorEvent::InvalidLiveData {
                                error: e.to_string(),
                            })
                        }
                        Err(e) if e.is_recoverable() => {
                            Some(ConnectorEvent::ConnectionLost(Disconnect::Recoverable {
                                error: e.to_string(),
                            }))
                        }
                        Err(e) => {
                            // Storage trouble is reported but does not end the channel
                            self.report(Some(table), e.key(), e.kind(), e.to_string());
                            None
                        }
                    }
                }
                Wake::Frame(Some(LiveFrame::Closed(reason))) => {
                    tracing::warn!("{}: live channel closed by server: {}", table, reason);
                    disable_kind = ErrorKind::NetworkUnrecoverable;
                    Some(ConnectorEvent::ConnectionLost(Disconnect::Unrecoverable {
                        reason: reason.to_string(),
                    }))
                }
                Wake::Frame(None) => {
                    frames = None;
                    Some(ConnectorEvent::ConnectionLost(Disconnect::Recoverable {
                        error: "live channel dropped".into(),
                    }))
                }
                Wake::Local => Some(ConnectorEvent::LocalChanges),
                Wake::Cancelled => {
                    self.end_session(table);
                    return;
                }
            };
            if let Some(event) = event {
                queue.extend(self.step(&mut session, event));
            }
        }
    }

    async fn subscribe_live(
        &self,
        table: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<LiveFrame>, EngineError> {
        self.cancellable(table, cancel, self.open_live(table)).await
    }

    async fn open_live(&self, table: &str) -> Result<mpsc::Receiver<LiveFrame>, EngineError> {
        let (meta, _) = self.table_metadata(table).await?;
        Ok(self.inner.remote.subscribe(table, meta.last_sync).await?)
    }

    /// Download whatever arrived while the live channel was down, then
    /// upload what piled up locally.
    async fn catch_up(&self, table: &str) -> Result<(), EngineError> {
        let (mut meta, _) = self.table_metadata(table).await?;
        let applied = self.download(table, &mut meta).await?;
        let uploaded = self.upload_pending(table).await?;
        tracing::debug!(
            "{}: caught up, applied {} remote change(s), uploaded {}",
            table,
            applied,
            uploaded
        );
        Ok(())
    }

    /// Turn a failed live-mode call into a connector event.
    ///
    /// Only network failures go back to the connector. Anything else ends
    /// the live task with the table in `Error`, unless it was cancelled.
    fn live_failed(
        &self,
        table: &str,
        cancel: &watch::Receiver<bool>,
        error: EngineError,
        disable_kind: &mut ErrorKind,
    ) -> Option<ConnectorEvent> {
        match (&error, error.kind()) {
            (EngineError::Cancelled(_), _) => {}
            _ if error.is_recoverable() => {
                return Some(ConnectorEvent::ConnectionLost(Disconnect::Recoverable {
                    error: error.to_string(),
                }));
            }
            (_, ErrorKind::NetworkUnrecoverable) => {
                *disable_kind = ErrorKind::NetworkUnrecoverable;
                return Some(ConnectorEvent::ConnectionLost(Disconnect::Unrecoverable {
                    reason: error.to_string(),
                }));
            }
            _ => {
                self.end_session(table);
                self.fail_table(table, cancel, &error);
                return None;
            }
        }
        self.end_session(table);
        None
    }

    fn live_notice(
        &self,
        table: &str,
        cancel: &watch::Receiver<bool>,
        notice: Notice,
        disable_kind: ErrorKind,
    ) {
        match notice {
            Notice::LiveConnected => tracing::info!("{}: live channel connected", table),
            Notice::Reconnecting {
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    "{}: live channel lost ({}), reconnect attempt {} in {:?}",
                    table,
                    error,
                    attempt,
                    delay
                );
                self.emit(StatusEvent::Reconnecting {
                    table: table.to_string(),
                    attempt,
                    delay,
                });
            }
            Notice::InvalidLiveData { count, error } => {
                self.report(
                    Some(table),
                    None,
                    ErrorKind::Protocol,
                    format!("invalid live data ({} in a row): {}", count, error),
                );
            }
            Notice::Disabled { reason } => {
                let disabled = self.settle(table, cancel, TableEvent::Disable, |slot| {
                    slot.cancel.send_replace(true);
                    slot.live = None;
                });
                if disabled.is_some() {
                    self.report(Some(table), None, disable_kind, reason);
                }
            }
        }
    }

    async fn apply_live(&self, table: &str, bytes: &[u8]) -> Result<ApplyResult, EngineError> {
        let entries = self.inner.remote.decode_live(table, bytes)?;
        if entries.is_empty() {
            return Ok(ApplyResult::default());
        }
        let newest_key = entries
            .iter()
            .map(|e| e.key_version)
            .max()
            .unwrap_or_default();
        if newest_key > self.inner.keys.latest_known(table).await? {
            self.refresh(table).await?;
        }

        let opened = self.inner.keys.decrypt_batch(table, &entries).await?;
        let result = self.inner.changes.apply_remote_changes(table, &opened).await?;
        let (mut meta, reset) = self.table_metadata(table).await?;
        if reset {
            // The pushed batch alone says nothing about what came before it
            self.download(table, &mut meta).await?;
        } else if let Some(newest) = entries.iter().map(|e| e.uploaded).max() {
            if newest > meta.last_sync {
                meta.last_sync = newest;
                self.inner.store.save_metadata(&meta).await?;
            }
        }
        Ok(result)
    }

    // ===== Keys =====

    fn announce_activation(&self, table: &str, before: KeyVersion, after: KeyVersion) {
        if after != before && after.is_some() {
            tracing::info!("{}: key {} is now active", table, after);
            self.emit(StatusEvent::KeyActivated {
                table: table.to_string(),
                key_version: after,
            });
        }
    }

    /// Fetch keys under the rotation guard so a concurrent rotation or
    /// acknowledgement never interleaves with the keystore update.
    async fn refresh(&self, table: &str) -> Result<KeyVersion, EngineError> {
        let _guard = self.inner.rotation_guard.lock().await;
        let before = self.inner.keys.active_version(table).await?;
        let after = self.inner.keys.refresh_keys(table).await?;
        self.announce_activation(table, before, after);
        Ok(after)
    }

    /// Stage a new key for `table`, wrapped for every device on the account.
    ///
    /// Refused while a previous rotation still awaits acknowledgements.
    pub async fn rotate_key(&self, table: &str) -> Result<RotationTicket, EngineError> {
        self.check_table(table)?;
        let _guard = self.inner.rotation_guard.lock().await;
        let before = self.inner.keys.active_version(table).await?;
        let ticket = self.inner.keys.rotate_key(table).await?;
        let after = self.inner.keys.active_version(table).await?;
        self.announce_activation(table, before, after);
        Ok(ticket)
    }

    /// Record `device_id`'s acknowledgement of the pending rotation of `table`.
    pub async fn acknowledge_rotation(
        &self,
        table: &str,
        device_id: DeviceId,
        key_version: KeyVersion,
    ) -> Result<RotationProgress, EngineError> {
        self.check_table(table)?;
        let _guard = self.inner.rotation_guard.lock().await;
        let before = self.inner.keys.active_version(table).await?;
        let progress = self
            .inner
            .keys
            .acknowledge_rotation(table, device_id, key_version)
            .await?;
        let after = self.inner.keys.active_version(table).await?;
        self.announce_activation(table, before, after);
        Ok(progress)
    }

    /// Fetch keys addressed to this device. Returns the active version.
    pub async fn refresh_keys(&self, table: &str) -> Result<KeyVersion, EngineError> {
        self.check_table(table)?;
        self.refresh(table).await
    }

    /// Remove a device and rotate every table key away from it.
    pub async fn remove_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<RotationTicket>, EngineError> {
        let _guard = self.inner.rotation_guard.lock().await;
        let tickets = self.inner.keys.remove_device(device_id).await?;
        for ticket in &tickets {
            if ticket.progress == RotationProgress::Completed {
                self.announce_activation(&ticket.table, KeyVersion::NONE, ticket.key_version);
            }
        }
        Ok(tickets)
    }

    // ===== Account =====

    /// This device's registration, if any.
    ///
    /// A corrupted registration is dropped and reported; the device then
    /// has to register or import again.
    pub async fn identity(&self) -> Result<Option<Identity>, EngineError> {
        match self.inner.store.get_system(KIND_IDENTITY, SELF_ROW, 0).await {
            Ok(identity) => Ok(identity),
            Err(StoreError::CorruptedSystemTable { reason }) => {
                self.inner
                    .store
                    .delete_system(KIND_IDENTITY, Some(SELF_ROW))
                    .await?;
                self.report(
                    None,
                    None,
                    ErrorKind::LocalCorruption,
                    format!("identity corrupted ({}), register again", reason),
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn device_seen(&self) -> Result<BTreeMap<String, KeyVersion>, EngineError> {
        let mut seen = BTreeMap::new();
        for table in self.inner.keys.tables().await? {
            let latest = self.inner.keys.latest_known(&table).await?;
            seen.insert(table, latest);
        }
        Ok(seen)
    }

    /// Register this device with `remote` under `account_id`.
    pub async fn register(
        &self,
        account_id: AccountId,
        remote: RemoteEndpoint,
        device_name: &str,
    ) -> Result<(), EngineError> {
        let mut record = self.inner.keys.device_record(device_name);
        record.last_seen_key_version = self.device_seen().await?;
        self.inner.remote.register_device(record).await?;

        let identity = Identity {
            account_id,
            device_name: device_name.to_string(),
            remote,
        };
        self.inner
            .store
            .put_system(KIND_IDENTITY, SELF_ROW, 0, &identity)
            .await?;
        tracing::info!("registered device {} as {:?}", self.inner.device_id, device_name);
        Ok(())
    }

    /// Delete the account remotely and wipe local identity and keys.
    ///
    /// Every table is disabled afterwards. Local rows are kept.
    pub async fn delete_account(&self) -> Result<(), EngineError> {
        if self.identity().await?.is_none() {
            return Err(EngineError::NotRegistered);
        }
        self.inner.remote.delete_account().await?;
        self.inner.keys.purge().await?;
        self.inner
            .store
            .delete_system(KIND_IDENTITY, Some(SELF_ROW))
            .await?;
        for table in self.tables() {
            let _ = self.transition(&table, TableEvent::Disable, |slot| {
                slot.cancel.send_replace(true);
                slot.live = None;
            });
            self.inner.sessions.remove(&table);
        }
        tracing::warn!("account deleted");
        Ok(())
    }

    /// Leave the account without deleting it.
    ///
    /// The device is removed remotely when the backend is reachable, then
    /// identity and keys are wiped and every table is disabled. With
    /// `keep_data` local rows stay and upload again after the next
    /// registration; otherwise they are deleted.
    pub async fn reset_account(&self, keep_data: bool) -> Result<(), EngineError> {
        if self.identity().await?.is_none() {
            return Err(EngineError::NotRegistered);
        }
        let tables = self.tables();
        for table in &tables {
            let _ = self.transition(table, TableEvent::Disable, |slot| {
                slot.cancel.send_replace(true);
                slot.live = None;
            });
            self.inner.sessions.remove(table);
        }

        if let Err(e) = self.inner.remote.remove_device(self.inner.device_id).await {
            let e = EngineError::from(e);
            self.report(
                None,
                None,
                e.kind(),
                format!("could not remove this device remotely: {}", e),
            );
        }
        {
            let _guard = self.inner.rotation_guard.lock().await;
            self.inner.keys.purge().await?;
        }
        self.inner
            .store
            .delete_system(KIND_IDENTITY, Some(SELF_ROW))
            .await?;
        for table in &tables {
            self.inner.store.reset_table(table, keep_data).await?;
        }
        tracing::warn!(
            "account reset, local data {}",
            if keep_data { "kept" } else { "deleted" }
        );
        Ok(())
    }

    /// Devices registered on the account.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, EngineError> {
        Ok(self.inner.remote.devices().await?)
    }

    /// Rename this device, locally and on the backend.
    pub async fn set_device_name(&self, name: &str) -> Result<(), EngineError> {
        let mut identity = self.identity().await?.ok_or(EngineError::NotRegistered)?;
        let mut record = self.inner.keys.device_record(name);
        record.last_seen_key_version = self.device_seen().await?;
        self.inner.remote.register_device(record).await?;

        identity.device_name = name.to_string();
        self.inner
            .store
            .put_system(KIND_IDENTITY, SELF_ROW, 0, &identity)
            .await?;
        tracing::info!("device {} renamed to {:?}", self.inner.device_id, name);
        Ok(())
    }

    // ===== Exchange =====

    /// Export identity and keys sealed under `password`, with Argon2id
    /// parameters scaled to this device's RAM.
    pub async fn export_bundle(
        &self,
        password: &str,
        include_remote: bool,
    ) -> Result<String, EngineError> {
        self.export_bundle_with(password, include_remote, Argon2Params::default())
            .await
    }

    /// Export with explicit Argon2id parameters.
    pub async fn export_bundle_with(
        &self,
        password: &str,
        include_remote: bool,
        params: Argon2Params,
    ) -> Result<String, EngineError> {
        if password.is_empty() {
            return Err(ExchangeError::EmptyPassword.into());
        }
        let _guard = self.inner.export_guard.lock().await;
        let identity = self.identity().await?.ok_or(ExchangeError::NotRegistered)?;

        let keys = self
            .inner
            .keys
            .export_keys()
            .await?
            .into_iter()
            .map(|(table, version, key, active)| BundleKey {
                table,
                key_version: version.value(),
                secret: STANDARD.encode(key.as_bytes()),
                active,
            })
            .collect::<Vec<_>>();
        let key_count = keys.len();
        let payload = IdentityPayload::new(
            identity.account_id,
            self.inner.device_id,
            include_remote.then(|| identity.remote.clone()),
            keys,
        );

        let password = Zeroizing::new(password.to_string());
        let bundle = tokio::task::spawn_blocking(move || seal_payload(&payload, &password, params))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))??;
        tracing::info!("exported bundle with {} key(s)", key_count);
        Ok(bundle)
    }

    /// Join the account described by an exported bundle, deleting the rows
    /// of every table registered here.
    pub async fn import_bundle(
        &self,
        bundle: &str,
        password: &str,
    ) -> Result<ImportedIdentity, EngineError> {
        self.import_bundle_with(bundle, password, false).await
    }

    /// Join the account described by an exported bundle.
    ///
    /// With `keep_data` the rows of registered tables stay and are merged
    /// into the joined account; when the device changes accounts they
    /// upload again from scratch. Without it they are deleted first. Tables
    /// must not be syncing.
    ///
    /// Only one import runs at a time; a concurrent call fails with
    /// `ImportInProgress`.
    pub async fn import_bundle_with(
        &self,
        bundle: &str,
        password: &str,
        keep_data: bool,
    ) -> Result<ImportedIdentity, EngineError> {
        if password.is_empty() {
            return Err(ExchangeError::EmptyPassword.into());
        }
        let _guard = self
            .inner
            .import_guard
            .try_lock()
            .map_err(|_| ExchangeError::ImportInProgress)?;

        let text = bundle.to_string();
        let password = Zeroizing::new(password.to_string());
        let validated = tokio::task::spawn_blocking(move || open_payload(&text, &password))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))??;

        let existing = self.identity().await?;
        let remote = match (&validated.remote, &existing) {
            (Some(remote), _) => remote.clone(),
            (None, Some(identity)) => identity.remote.clone(),
            (None, None) => {
                return Err(ExchangeError::InvalidImportData(
                    "bundle carries no remote and this device has none configured".into(),
                )
                .into())
            }
        };
        let switching = existing
            .as_ref()
            .is_some_and(|identity| identity.account_id != validated.account_id);
        let device_name = existing
            .map(|identity| identity.device_name)
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        if !keep_data || switching {
            let local = self.tables();
            if let Some(busy) = local
                .iter()
                .find(|table| self.status(table).is_ok_and(|state| state.is_busy()))
            {
                return Err(EngineError::AlreadySynchronizing {
                    table: busy.clone(),
                });
            }
            if switching {
                let _guard = self.inner.rotation_guard.lock().await;
                self.inner.keys.purge().await?;
            }
            for table in &local {
                self.inner.store.reset_table(table, keep_data).await?;
            }
        }

        let mut tables: Vec<String> = Vec::new();
        for (table, version, secret, active) in &validated.keys {
            self.inner
                .keys
                .import_key(table, *version, &TableKey::from_bytes(**secret), *active)
                .await?;
            if !tables.contains(table) {
                self.register_table(table).await?;
                tables.push(table.clone());
            }
        }

        let mut record = self.inner.keys.device_record(&device_name);
        record.last_seen_key_version = self.device_seen().await?;
        self.inner.remote.register_device(record).await?;

        let identity = Identity {
            account_id: validated.account_id,
            device_name,
            remote: remote.clone(),
        };
        self.inner
            .store
            .put_system(KIND_IDENTITY, SELF_ROW, 0, &identity)
            .await?;

        tracing::info!(
            "imported {} key(s) for {} table(s) from device {}",
            validated.keys.len(),
            tables.len(),
            validated.partner_device
        );
        Ok(ImportedIdentity {
            account_id: validated.account_id,
            partner_device: validated.partner_device,
            remote,
            tables,
            key_count: validated.keys.len(),
        })
    }
}

/// Read this device's id, creating it on first open.
///
/// A corrupted row is rebuilt from the owner named in the keystore. When no
/// stored key names one, a fresh id is issued and the identity and keys bound
/// to the old id are dropped, so the device has to join again.
async fn load_device_id(store: &LocalStore) -> Result<DeviceId, EngineError> {
    let reason = match store.get_system::<DeviceId>(KIND_DEVICE, SELF_ROW, 0).await {
        Ok(Some(id)) => return Ok(id),
        Ok(None) => None,
        Err(StoreError::CorruptedSystemTable { reason }) => Some(reason),
        Err(e) => return Err(e.into()),
    };

    let id = match &reason {
        Some(reason) => match keystore_owner(store).await {
            Some(id) => {
                tracing::warn!("device row corrupted ({}), recovered id {} from the keystore", reason, id);
                id
            }
            None => {
                let id = DeviceId::random();
                purge_keystore(store).await?;
                store.delete_system(KIND_IDENTITY, Some(SELF_ROW)).await?;
                tracing::warn!(
                    "device row corrupted ({}), issued new id {}; register or import again",
                    reason,
                    id
                );
                id
            }
        },
        None => {
            let id = DeviceId::random();
            tracing::info!("created device id {}", id);
            id
        }
    };
    store.put_system(KIND_DEVICE, SELF_ROW, 0, &id).await?;
    Ok(id)
}

/// Registered tables. Corrupted registrations are rebuilt from the metadata
/// tables present on disk.
async fn load_registrations(store: &LocalStore) -> Result<Vec<String>, EngineError> {
    match store.list_system::<()>(KIND_TABLE, None).await {
        Ok(rows) => Ok(rows.into_iter().map(|(table, _, ())| table).collect()),
        Err(StoreError::CorruptedSystemTable { reason }) => {
            let tables = store.tables_on_disk().await?;
            store.delete_system(KIND_TABLE, None).await?;
            for table in &tables {
                store.put_system(KIND_TABLE, table, 0, &()).await?;
            }
            tracing::warn!(
                "table registrations corrupted ({}), rebuilt {} from disk",
                reason,
                tables.len()
            );
            Ok(tables)
        }
        Err(e) => Err(e.into()),
    }
}

/// Forward change notices of live tables to their live task.
fn spawn_dispatcher<B: RemoteBackend>(
    inner: Weak<Inner<B>>,
    mut notices: mpsc::Receiver<ChangeNotice>,
) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let Some(engine) = inner.upgrade() else {
                break;
            };
            let live = engine.tables.get(&notice.table).and_then(|slot| {
                if slot.state == TableState::LiveSyncing {
                    slot.live.clone()
                } else {
                    None
                }
            });
            if let Some(live) = live {
                // A wake-up is already queued when full
                let _ = live.try_send(());
            }
        }
    });
}
