//! Identity/device exchange bundles.
//!
//! An export bundle carries the account identity, optionally the remote
//! endpoint, and every table key, sealed under a password with Argon2id and
//! XChaCha20-Poly1305. Importing it on a new device adds that device to the
//! account.

use serde::{Deserialize, Serialize};
use tablesync_core::{BundleError, IdentityPayload, RemoteEndpoint, SealedBundle, ValidatedIdentity};
use tablesync_types::{AccountId, DeviceId, ErrorKind};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{fill_random, Argon2Params, PasswordKey, SALT_SIZE};

/// Exchange errors.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The password is empty.
    #[error("password must not be empty")]
    EmptyPassword,

    /// This device has no identity to export.
    #[error("device is not registered to a backend")]
    NotRegistered,

    /// Wrong password or corrupt bundle.
    #[error("bundle decryption failed: wrong password or corrupt bundle")]
    DecryptionFailed,

    /// The bundle decrypted but its content is not a valid identity.
    #[error("invalid import data: {0}")]
    InvalidImportData(String),

    /// Another import is running.
    #[error("an import is already in progress")]
    ImportInProgress,

    /// Sealing failed.
    #[error("bundle sealing failed: {0}")]
    SealFailed(String),
}

impl ExchangeError {
    /// Failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::EmptyPassword
            | ExchangeError::NotRegistered
            | ExchangeError::DecryptionFailed
            | ExchangeError::InvalidImportData(_) => ErrorKind::Input,
            ExchangeError::ImportInProgress => ErrorKind::Busy,
            ExchangeError::SealFailed(_) => ErrorKind::Internal,
        }
    }
}

/// This device's registration with a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Account the device belongs to.
    pub account_id: AccountId,
    /// Human-readable device name.
    pub device_name: String,
    /// Where the account's remote store lives.
    pub remote: RemoteEndpoint,
}

/// What an import brought onto this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedIdentity {
    /// Account joined.
    pub account_id: AccountId,
    /// Device that produced the bundle.
    pub partner_device: DeviceId,
    /// Remote endpoint now in use.
    pub remote: RemoteEndpoint,
    /// Tables that received keys.
    pub tables: Vec<String>,
    /// Number of keys imported.
    pub key_count: usize,
}

/// Seal an identity payload under `password`.
pub fn seal_payload(
    payload: &IdentityPayload,
    password: &str,
    params: Argon2Params,
) -> Result<String, ExchangeError> {
    if password.is_empty() {
        return Err(ExchangeError::EmptyPassword);
    }
    let sealing = |e: &dyn std::fmt::Display| ExchangeError::SealFailed(e.to_string());

    let mut salt = [0u8; SALT_SIZE];
    fill_random(&mut salt).map_err(|e| sealing(&e))?;
    let key = PasswordKey::derive(password, &salt, params).map_err(|e| sealing(&e))?;
    let json = Zeroizing::new(payload.to_json().map_err(|e| sealing(&e))?);
    let (nonce, data) = key.seal(&json).map_err(|e| sealing(&e))?;

    SealedBundle::new(
        &salt,
        params.memory_mib(),
        params.iterations(),
        params.parallelism(),
        &nonce,
        &data,
    )
    .to_text()
    .map_err(|e| sealing(&e))
}

/// Open and validate a bundle produced by [`seal_payload`].
pub fn open_payload(text: &str, password: &str) -> Result<ValidatedIdentity, ExchangeError> {
    if password.is_empty() {
        return Err(ExchangeError::EmptyPassword);
    }
    let bundle = SealedBundle::from_text(text).map_err(|e| match e {
        BundleError::UnsupportedVersion(_) | BundleError::UnsupportedScheme(_) => {
            ExchangeError::InvalidImportData(e.to_string())
        }
        _ => ExchangeError::DecryptionFailed,
    })?;
    let salt = bundle
        .salt_bytes()
        .map_err(|_| ExchangeError::DecryptionFailed)?;
    let nonce = bundle
        .nonce_bytes()
        .map_err(|_| ExchangeError::DecryptionFailed)?;
    let data = bundle
        .data_bytes()
        .map_err(|_| ExchangeError::DecryptionFailed)?;

    let params = Argon2Params::new(bundle.memory_mib, bundle.iterations, bundle.parallelism);
    let key =
        PasswordKey::derive(password, &salt, params).map_err(|_| ExchangeError::DecryptionFailed)?;
    let json = Zeroizing::new(
        key.open(&nonce, &data)
            .map_err(|_| ExchangeError::DecryptionFailed)?,
    );

    IdentityPayload::parse(&json).map_err(|e| ExchangeError::InvalidImportData(e.to_string()))
}
