//! # sync-client
//!
//! Client engine for tablesync: end-to-end encrypted, multi-device sync of
//! local SQLite tables through a remote store that only ever sees ciphertext.
//!
//! This is the main library that applications use to sync data.
//!
//! ## Features
//!
//! - **Change Log**: every local write is recorded as a pending change in the
//!   same transaction as the data mutation
//! - **E2E Encryption**: XChaCha20-Poly1305 with 192-bit nonces, one key per
//!   table and key version, wrapped per device with X25519
//! - **Key Rotation**: new keys activate only once every device acknowledged
//! - **Live Sync**: push subscription with capped exponential backoff
//! - **Device Exchange**: password-sealed bundles (device-adaptive Argon2id)
//!   to add a device to an account
//! - **Pure State Machines**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use tablesync_client::{EngineConfig, MockBackend, StaticSession, SyncEngine};
//!
//! let engine = SyncEngine::open(config, backend, session, keypair).await?;
//! engine.register_table("notes").await?;
//! engine.write("notes", "k1", b"hello").await?;
//! engine.resync("notes").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changelog;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod remote;
mod session;
pub mod store;

pub use changelog::{ApplyResult, ChangeLog, ChangeNotice};
pub use config::{
    BackoffConfig, ConfigError, EngineConfig, LiveConfig, RemoteConfig, StorageConfig, SyncConfig,
};
pub use crypto::{
    Argon2Params, CryptoError, DeviceKeyPair, TableKey, X25519KeyPair, KEY_SIZE, NONCE_SIZE,
};
pub use engine::SyncEngine;
pub use error::EngineError;
pub use exchange::{ExchangeError, Identity, ImportedIdentity};
pub use keys::{KeyError, KeyManager, RotationTicket};
pub use remote::{
    Auth, BackendError, LiveFrame, MockBackend, RemoteBackend, RemoteConnector, RemoteError,
    SessionProvider, StaticSession,
};
pub use store::{LocalStore, StoreError, TableMetadata};
pub use tablesync_core::{
    ConnectorState, RemoteEndpoint, RotationProgress, StatusEvent, TableError, TableState,
};
