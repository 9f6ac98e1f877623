//! Remote protocol messages for tablesync.
//!
//! Batched download/upload responses, live-channel frames, and the
//! device/key registration records kept by the remote store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DeviceId, EncryptedEntry, KeyVersion, SyncError, Timestamp};

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u8 = 1;

/// A page of changes returned by a batched download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBatch {
    /// The table's key version as the server currently declares it.
    pub table_key_version: KeyVersion,
    /// Changes with `uploaded > since`, ordered by upload timestamp.
    pub entries: Vec<EncryptedEntry>,
    /// Whether more pages are available after this one.
    pub has_more: bool,
}

/// The server's acknowledgement of one uploaded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Local version that was uploaded.
    pub local_version: u64,
    /// Version assigned by the server.
    pub assigned_version: u64,
    /// Upload timestamp assigned by the server.
    pub uploaded: Timestamp,
}

/// Why the server closed a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The table was deleted remotely.
    TableDeleted,
    /// Client and server speak incompatible protocol versions.
    ProtocolMismatch {
        /// Version the client announced.
        client: u8,
        /// Version the server supports.
        server: u8,
    },
    /// The account was deleted.
    AccountDeleted,
    /// Any other explicit server-side close.
    Other(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::TableDeleted => write!(f, "table deleted remotely"),
            CloseReason::ProtocolMismatch { client, server } => {
                write!(f, "protocol mismatch (client {}, server {})", client, server)
            }
            CloseReason::AccountDeleted => write!(f, "account deleted"),
            CloseReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// A push delivered over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LiveMessage {
    /// New changes for the subscribed table.
    Changes {
        /// Table the changes belong to.
        table: String,
        /// The changes, ordered by upload timestamp.
        entries: Vec<EncryptedEntry>,
    },
    /// Keepalive with no data.
    Ping,
}

impl LiveMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// A device authorized on the account, as recorded by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// The device's identifier.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub name: String,
    /// X25519 public key that table keys are wrapped to.
    pub public_key: [u8; 32],
    /// Latest key version this device acknowledged, per table.
    pub last_seen_key_version: BTreeMap<String, KeyVersion>,
}

impl DeviceRecord {
    /// Create a record that has not acknowledged any key yet.
    pub fn new(device_id: DeviceId, name: &str, public_key: [u8; 32]) -> Self {
        Self {
            device_id,
            name: name.to_string(),
            public_key,
            last_seen_key_version: BTreeMap::new(),
        }
    }

    /// The key version this device last acknowledged for `table`.
    pub fn seen(&self, table: &str) -> KeyVersion {
        self.last_seen_key_version
            .get(table)
            .copied()
            .unwrap_or(KeyVersion::NONE)
    }
}

/// A table key sealed to one device's public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Table the key belongs to.
    pub table: String,
    /// Version of the key.
    pub key_version: KeyVersion,
    /// Device the key is sealed to.
    pub device_id: DeviceId,
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_public: [u8; 32],
    /// Encryption nonce (24 bytes for XChaCha20).
    pub nonce: [u8; 24],
    /// The sealed key material.
    pub sealed: Vec<u8>,
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("table", &self.table)
            .field("key_version", &self.key_version)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}
