//! Identity export bundle format.
//!
//! This module provides the two layers of a device-exchange bundle:
//! - [`SealedBundle`]: the outer, password-sealed envelope, encoded as
//!   URL-safe base64 JSON so it can be copied as text
//! - [`IdentityPayload`]: the inner JSON with account identity, the remote
//!   endpoint and every table key, plus its schema validation
//!
//! Sealing itself (Argon2id + XChaCha20-Poly1305) happens in sync-client.
//! Everything here is pure encoding and validation.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tablesync_types::{AccountId, DeviceId, KeyVersion};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::table::is_valid_table_name;

/// Outer bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// The only supported sealing scheme.
pub const BUNDLE_SCHEME: &str = "argon2id-xchacha20poly1305";

/// Marker identifying the inner payload.
pub const PAYLOAD_FORMAT: &str = "tablesync-identity";

/// Error type for bundle encoding and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// The outer envelope cannot be decoded (bad base64, JSON, or field sizes).
    #[error("malformed bundle: {0}")]
    Malformed(String),

    /// The outer envelope uses an unknown version.
    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u32),

    /// The outer envelope uses an unknown sealing scheme.
    #[error("unsupported bundle scheme: {0}")]
    UnsupportedScheme(String),

    /// The decrypted payload fails schema validation.
    #[error("invalid identity data: {0}")]
    InvalidData(String),
}

/// The password-sealed outer envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedBundle {
    /// Bundle format version.
    pub version: u32,
    /// Sealing scheme name.
    pub scheme: String,
    /// Argon2id salt (standard base64).
    pub salt: String,
    /// Argon2id memory cost in MiB.
    pub memory_mib: u32,
    /// Argon2id iterations.
    pub iterations: u32,
    /// Argon2id lanes.
    pub parallelism: u32,
    /// XChaCha20 nonce (standard base64).
    pub nonce: String,
    /// Sealed [`IdentityPayload`] JSON (standard base64).
    pub data: String,
}

impl SealedBundle {
    /// Build an envelope from raw parts.
    pub fn new(
        salt: &[u8],
        memory_mib: u32,
        iterations: u32,
        parallelism: u32,
        nonce: &[u8; 24],
        data: &[u8],
    ) -> Self {
        Self {
            version: BUNDLE_VERSION,
            scheme: BUNDLE_SCHEME.to_string(),
            salt: STANDARD.encode(salt),
            memory_mib,
            iterations,
            parallelism,
            nonce: STANDARD.encode(nonce),
            data: STANDARD.encode(data),
        }
    }

    /// Encode as URL-safe base64 JSON text.
    pub fn to_text(&self) -> Result<String, BundleError> {
        let json = serde_json::to_vec(self).map_err(|e| BundleError::Malformed(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode from the text produced by [`SealedBundle::to_text`].
    pub fn from_text(text: &str) -> Result<Self, BundleError> {
        let json = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| BundleError::Malformed(format!("base64 decode: {}", e)))?;
        let bundle: Self = serde_json::from_slice(&json)
            .map_err(|e| BundleError::Malformed(format!("json parse: {}", e)))?;
        if bundle.version != BUNDLE_VERSION {
            return Err(BundleError::UnsupportedVersion(bundle.version));
        }
        if bundle.scheme != BUNDLE_SCHEME {
            return Err(BundleError::UnsupportedScheme(bundle.scheme));
        }
        Ok(bundle)
    }

    /// Decoded salt bytes.
    pub fn salt_bytes(&self) -> Result<Vec<u8>, BundleError> {
        decode_field("salt", &self.salt)
    }

    /// Decoded nonce bytes.
    pub fn nonce_bytes(&self) -> Result<[u8; 24], BundleError> {
        let bytes = decode_field("nonce", &self.nonce)?;
        bytes
            .try_into()
            .map_err(|_| BundleError::Malformed("nonce must be 24 bytes".into()))
    }

    /// Decoded sealed payload bytes.
    pub fn data_bytes(&self) -> Result<Vec<u8>, BundleError> {
        decode_field("data", &self.data)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, BundleError> {
    STANDARD
        .decode(value)
        .map_err(|e| BundleError::Malformed(format!("{}: {}", name, e)))
}

/// Where the account's remote store lives.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEndpoint {
    /// Base URL of the remote store.
    pub url: String,
    /// Optional access key sent alongside the bearer credential.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Live-channel keepalive interval in seconds.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_keepalive_secs() -> u64 {
    60
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("url", &self.url)
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .field("keepalive_secs", &self.keepalive_secs)
            .finish()
    }
}

impl RemoteEndpoint {
    /// Endpoint with default keepalive and no access key.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            access_key: None,
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

/// One table key carried in a bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct BundleKey {
    /// Table the key belongs to.
    pub table: String,
    /// Key version.
    pub key_version: u32,
    /// Raw 32-byte secret (standard base64).
    pub secret: String,
    /// Whether this is the table's active upload key.
    pub active: bool,
}

impl BundleKey {
    /// Decode the secret, checking its length.
    pub fn secret_bytes(&self) -> Result<[u8; 32], BundleError> {
        let bytes = STANDARD
            .decode(&self.secret)
            .map_err(|e| BundleError::InvalidData(format!("key secret: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| BundleError::InvalidData("key secret must be 32 bytes".into()))
    }
}

// Intentionally opaque debug to avoid logging secrets
impl std::fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleKey")
            .field("table", &self.table)
            .field("key_version", &self.key_version)
            .field("secret", &"[REDACTED]")
            .field("active", &self.active)
            .finish()
    }
}

/// The decrypted identity content of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPayload {
    /// Must equal [`PAYLOAD_FORMAT`].
    pub format: String,
    /// Payload schema version.
    pub version: u32,
    /// Account the bundle belongs to.
    pub account_id: String,
    /// Device that produced the bundle.
    pub partner_device: String,
    /// Remote endpoint, when the exporter chose to include it.
    #[serde(default)]
    pub remote: Option<RemoteEndpoint>,
    /// Every table key known to the exporter.
    pub keys: Vec<BundleKey>,
    /// Unix timestamp (seconds) of export.
    pub created_at: u64,
}

/// An [`IdentityPayload`] that passed validation, with typed fields.
#[derive(Clone)]
pub struct ValidatedIdentity {
    /// Account the bundle belongs to.
    pub account_id: AccountId,
    /// Device that produced the bundle.
    pub partner_device: DeviceId,
    /// Remote endpoint, if included.
    pub remote: Option<RemoteEndpoint>,
    /// Keys as `(table, version, secret, active)`.
    pub keys: Vec<(String, KeyVersion, Zeroizing<[u8; 32]>, bool)>,
}

impl std::fmt::Debug for ValidatedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<(&str, KeyVersion, &str, bool)> = self
            .keys
            .iter()
            .map(|(table, version, _, active)| (table.as_str(), *version, "[REDACTED]", *active))
            .collect();
        f.debug_struct("ValidatedIdentity")
            .field("account_id", &self.account_id)
            .field("partner_device", &self.partner_device)
            .field("remote", &self.remote)
            .field("keys", &keys)
            .finish()
    }
}

impl IdentityPayload {
    /// Create a payload for the given account and exporter.
    pub fn new(
        account_id: AccountId,
        partner_device: DeviceId,
        remote: Option<RemoteEndpoint>,
        keys: Vec<BundleKey>,
    ) -> Self {
        Self {
            format: PAYLOAD_FORMAT.to_string(),
            version: 1,
            account_id: account_id.to_string(),
            partner_device: partner_device.to_string(),
            remote,
            keys,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, BundleError> {
        serde_json::to_vec(self).map_err(|e| BundleError::InvalidData(e.to_string()))
    }

    /// Parse and validate decrypted JSON bytes.
    pub fn parse(json: &[u8]) -> Result<ValidatedIdentity, BundleError> {
        let payload: IdentityPayload = serde_json::from_slice(json)
            .map_err(|e| BundleError::InvalidData(format!("json parse: {}", e)))?;
        payload.validate()
    }

    /// Check the payload against the schema.
    pub fn validate(&self) -> Result<ValidatedIdentity, BundleError> {
        let invalid = |msg: String| -> Result<ValidatedIdentity, BundleError> {
            Err(BundleError::InvalidData(msg))
        };

        if self.format != PAYLOAD_FORMAT {
            return invalid(format!("unexpected format {:?}", self.format));
        }
        if self.version != 1 {
            return invalid(format!("unsupported payload version {}", self.version));
        }
        let account_id = match AccountId::parse(&self.account_id) {
            Some(id) => id,
            None => return invalid("account id is not a UUID".into()),
        };
        let partner_device = match DeviceId::parse(&self.partner_device) {
            Some(id) => id,
            None => return invalid("partner device id is malformed".into()),
        };
        if let Some(remote) = &self.remote {
            if remote.url.trim().is_empty() {
                return invalid("remote url is empty".into());
            }
        }

        let mut seen = BTreeSet::new();
        let mut active_per_table: BTreeMap<&str, u32> = BTreeMap::new();
        let mut keys = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            if !is_valid_table_name(&key.table) {
                return invalid(format!("invalid table name {:?}", key.table));
            }
            if key.key_version == 0 {
                return invalid(format!("key version 0 for table {}", key.table));
            }
            if !seen.insert((key.table.as_str(), key.key_version)) {
                return invalid(format!(
                    "duplicate key v{} for table {}",
                    key.key_version, key.table
                ));
            }
            if key.active {
                *active_per_table.entry(key.table.as_str()).or_default() += 1;
            }
            keys.push((
                key.table.clone(),
                KeyVersion::new(key.key_version),
                Zeroizing::new(key.secret_bytes()?),
                key.active,
            ));
        }
        for (table, _) in &seen {
            if active_per_table.get(table).copied().unwrap_or(0) != 1 {
                return invalid(format!("table {} must have exactly one active key", table));
            }
        }

        Ok(ValidatedIdentity {
            account_id,
            partner_device,
            remote: self.remote.clone(),
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(table: &str, version: u32, active: bool) -> BundleKey {
        BundleKey {
            table: table.into(),
            key_version: version,
            secret: STANDARD.encode([version as u8; 32]),
            active,
        }
    }

    fn payload() -> IdentityPayload {
        IdentityPayload::new(
            AccountId::new(),
            DeviceId::random(),
            Some(RemoteEndpoint::new("https://sync.example.com")),
            vec![key("notes", 1, false), key("notes", 2, true), key("tags", 1, true)],
        )
    }

    // ===== Outer Envelope Tests =====

    #[test]
    fn sealed_bundle_text_roundtrip() {
        let bundle = SealedBundle::new(b"0123456789abcdef", 19, 2, 1, &[9u8; 24], b"ciphertext");
        let text = bundle.to_text().unwrap();
        let decoded = SealedBundle::from_text(&text).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(decoded.nonce_bytes().unwrap(), [9u8; 24]);
        assert_eq!(decoded.data_bytes().unwrap(), b"ciphertext");
    }

    #[test]
    fn garbage_text_is_malformed() {
        assert!(matches!(
            SealedBundle::from_text("!!not base64!!"),
            Err(BundleError::Malformed(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(
            SealedBundle::from_text(&not_json),
            Err(BundleError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let mut bundle = SealedBundle::new(b"salt", 19, 2, 1, &[0u8; 24], b"x");
        bundle.scheme = "rot13".into();
        let text = bundle.to_text().unwrap();
        assert_eq!(
            SealedBundle::from_text(&text),
            Err(BundleError::UnsupportedScheme("rot13".into()))
        );
    }

    #[test]
    fn short_nonce_is_malformed() {
        let mut bundle = SealedBundle::new(b"salt", 19, 2, 1, &[0u8; 24], b"x");
        bundle.nonce = STANDARD.encode([0u8; 12]);
        assert!(matches!(bundle.nonce_bytes(), Err(BundleError::Malformed(_))));
    }

    // ===== Payload Validation Tests =====

    #[test]
    fn valid_payload_parses() {
        let original = payload();
        let json = original.to_json().unwrap();
        let identity = IdentityPayload::parse(&json).unwrap();
        assert_eq!(identity.account_id.to_string(), original.account_id);
        assert_eq!(identity.keys.len(), 3);
        assert_eq!(identity.keys[1].1, KeyVersion::new(2));
        assert!(identity.keys[1].3);
    }

    #[test]
    fn wrong_format_marker_is_invalid() {
        let mut p = payload();
        p.format = "something-else".into();
        assert!(matches!(p.validate(), Err(BundleError::InvalidData(_))));
    }

    #[test]
    fn bad_account_id_is_invalid() {
        let mut p = payload();
        p.account_id = "not-a-uuid".into();
        assert!(matches!(p.validate(), Err(BundleError::InvalidData(_))));
    }

    #[test]
    fn table_without_active_key_is_invalid() {
        let mut p = payload();
        p.keys = vec![key("notes", 1, false)];
        assert!(matches!(p.validate(), Err(BundleError::InvalidData(_))));
    }

    #[test]
    fn two_active_keys_is_invalid() {
        let mut p = payload();
        p.keys = vec![key("notes", 1, true), key("notes", 2, true)];
        assert!(matches!(p.validate(), Err(BundleError::InvalidData(_))));
    }

    #[test]
    fn short_secret_is_invalid() {
        let mut p = payload();
        p.keys[0].secret = STANDARD.encode([1u8; 16]);
        assert!(matches!(p.validate(), Err(BundleError::InvalidData(_))));
    }

    #[test]
    fn non_json_is_invalid_data() {
        assert!(matches!(
            IdentityPayload::parse(b"{not json"),
            Err(BundleError::InvalidData(_))
        ));
    }

    #[test]
    fn bundle_key_debug_redacts_secret() {
        let debug = format!("{:?}", key("notes", 1, true));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&STANDARD.encode([1u8; 32])));
    }

    #[test]
    fn endpoint_debug_redacts_access_key() {
        let mut remote = RemoteEndpoint::new("https://sync.example.com");
        remote.access_key = Some("ak-live-51f0c2".into());
        let debug = format!("{:?}", remote);
        assert!(debug.contains("https://sync.example.com"));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("ak-live-51f0c2"));

        let mut p = payload();
        p.remote = Some(remote);
        assert!(!format!("{:?}", p).contains("ak-live-51f0c2"));
    }

    #[test]
    fn validated_identity_debug_hides_secrets() {
        let mut p = payload();
        let mut remote = RemoteEndpoint::new("https://sync.example.com");
        remote.access_key = Some("ak-live-51f0c2".into());
        p.remote = Some(remote);
        let identity = p.validate().unwrap();
        assert_eq!(*identity.keys[2].2, [1u8; 32]);

        let debug = format!("{:?}", identity);
        assert!(debug.contains("notes"));
        assert!(!debug.contains("ak-live-51f0c2"));
        // [2u8; 32] would print as a run of "2, 2, 2"
        assert!(!debug.contains("2, 2, 2"));
    }
}
