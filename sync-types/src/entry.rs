//! Change entries and their encrypted envelopes.

use serde::{Deserialize, Serialize};

use crate::{KeyVersion, Timestamp};

/// One versioned insert/update/delete recorded against a key.
///
/// Uniquely identified by `(table, key)`. A `None` payload is a tombstone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Table the change belongs to.
    pub table: String,
    /// Primary key of the changed row.
    pub key: String,
    /// Version, monotonic per key.
    pub version: u64,
    /// Row payload, or `None` for a deletion.
    pub payload: Option<Vec<u8>>,
    /// Local wall-clock time of the write in milliseconds (informational only).
    pub local_timestamp: u64,
}

impl ChangeEntry {
    /// Create an upsert entry.
    pub fn upsert(table: &str, key: &str, version: u64, payload: Vec<u8>) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            version,
            payload: Some(payload),
            local_timestamp: now_millis(),
        }
    }

    /// Create a tombstone entry.
    pub fn tombstone(table: &str, key: &str, version: u64) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            version,
            payload: None,
            local_timestamp: now_millis(),
        }
    }

    /// Whether this entry marks a deletion.
    pub fn is_deletion(&self) -> bool {
        self.payload.is_none()
    }
}

impl std::fmt::Debug for ChangeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEntry")
            .field("table", &self.table)
            .field("key", &self.key)
            .field("version", &self.version)
            .field(
                "payload",
                &self
                    .payload
                    .as_ref()
                    .map(|p| format!("[{} bytes REDACTED]", p.len())),
            )
            .field("local_timestamp", &self.local_timestamp)
            .finish()
    }
}

/// The encrypted form of a [`ChangeEntry`] as held by the remote store.
///
/// The table, key and version stay in the clear so the remote can order
/// changes; the payload is sealed with the table key named by `key_version`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEntry {
    /// Table the change belongs to.
    pub table: String,
    /// Primary key of the changed row.
    pub key: String,
    /// Version of the change (server-assigned once uploaded).
    pub version: u64,
    /// Version of the table key the payload is sealed with.
    pub key_version: KeyVersion,
    /// Encryption nonce (24 bytes for XChaCha20).
    pub nonce: [u8; 24],
    /// Sealed payload. Empty plaintext for tombstones.
    pub ciphertext: Vec<u8>,
    /// Whether this entry is a tombstone.
    pub deleted: bool,
    /// Server-assigned upload timestamp (zero before upload).
    pub uploaded: Timestamp,
}

impl std::fmt::Debug for EncryptedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedEntry")
            .field("table", &self.table)
            .field("key", &self.key)
            .field("version", &self.version)
            .field("key_version", &self.key_version)
            .field("ciphertext", &format!("[{} bytes]", self.ciphertext.len()))
            .field("deleted", &self.deleted)
            .field("uploaded", &self.uploaded)
            .finish()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
