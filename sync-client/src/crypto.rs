//! Cryptographic primitives for tablesync.
//!
//! This module provides:
//! - [`TableKey`]: per-table XChaCha20-Poly1305 payload encryption
//! - Device key wrapping: X25519 (ephemeral-static) + HKDF-SHA256 +
//!   XChaCha20-Poly1305, behind the [`DeviceKeyPair`] trait
//! - Device-adaptive Argon2id for password-sealed export bundles
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Payload ciphertext is bound to `(table, key, keyVersion, deleted)` as
//!   associated data, so sealed rows cannot be swapped between keys
//! - Argon2id parameters scale with available RAM and travel with the bundle

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use tablesync_types::{DeviceId, KeyVersion, WrappedKey};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Salt size for bundle key derivation.
pub const SALT_SIZE: usize = 16;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The operating system RNG failed.
    #[error("random number generation failed: {0}")]
    Random(String),

    /// A key was wrapped for a different device.
    #[error("wrapped key is addressed to {0}")]
    WrongRecipient(DeviceId),
}

/// Fill `buf` from the operating system RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| CryptoError::Random(e.to_string()))
}

/// Argon2id parameters for device-adaptive key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// Create parameters based on available RAM in MB.
    ///
    /// Scaling:
    /// - < 2000 MB: 12 MiB, 3 iterations (low-end mobile)
    /// - < 4000 MB: 19 MiB, 2 iterations (mid-range mobile)
    /// - < 8000 MB: 46 MiB, 1 iteration (high-end mobile)
    /// - >= 8000 MB: 64 MiB, 3 iterations (desktop)
    pub fn for_ram_mb(ram_mb: u64) -> Self {
        if ram_mb < 2000 {
            Self::new(12, 3, 1)
        } else if ram_mb < 4000 {
            Self::new(19, 2, 1)
        } else if ram_mb < 8000 {
            Self::new(46, 1, 1)
        } else {
            Self::new(64, 3, 4)
        }
    }

    /// Explicit parameters, e.g. as recorded in an imported bundle.
    pub fn new(memory_mib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Get memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Get iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Get lane count.
    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    /// Convert to argon2 Params. Rejects out-of-range values from untrusted bundles.
    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        if self.memory_mib == 0 || self.memory_mib > 1024 || self.iterations > 16 {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "argon2 parameters out of range: {:?}",
                self
            )));
        }
        Params::new(
            self.memory_mib * 1024, // Convert MiB to KiB
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::for_ram_mb(detect_available_ram_mb())
    }
}

/// Detect available RAM in megabytes.
pub fn detect_available_ram_mb() -> u64 {
    use sysinfo::System;
    let sys = System::new_all();
    sys.total_memory() / (1024 * 1024) // Convert bytes to MB
}

/// Symmetric key protecting one version of one table's payloads.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TableKey([u8; KEY_SIZE]);

impl TableKey {
    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt `plaintext` bound to `aad`.
    ///
    /// Returns (nonce, ciphertext). Nonce is 192 bits (24 bytes),
    /// safe for random generation without coordination.
    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        seal_with(&self.0, plaintext, aad)
    }

    /// Decrypt data produced by [`TableKey::seal`].
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        open_with(&self.0, nonce, ciphertext, aad)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TableKey([REDACTED])")
    }
}

/// Associated data binding a sealed payload to its row.
pub fn entry_aad(table: &str, key: &str, key_version: KeyVersion, deleted: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(table.len() + key.len() + 8);
    aad.extend_from_slice(table.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&key_version.value().to_be_bytes());
    aad.push(deleted as u8);
    aad
}

fn seal_with(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    fill_random(&mut nonce_bytes)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

    Ok((nonce_bytes, ciphertext))
}

fn open_with(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// A key derived from a user password for sealing export bundles.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey([u8; KEY_SIZE]);

impl PasswordKey {
    /// Derive with Argon2id.
    pub fn derive(password: &str, salt: &[u8], params: Argon2Params) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            params.to_argon2_params()?,
        );
        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut output)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(output))
    }

    /// Encrypt a bundle payload.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        seal_with(&self.0, plaintext, BUNDLE_AAD)
    }

    /// Decrypt a bundle payload.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_with(&self.0, nonce, ciphertext, BUNDLE_AAD)
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PasswordKey([REDACTED])")
    }
}

const BUNDLE_AAD: &[u8] = b"tablesync-bundle-v1";
const WRAP_INFO: &[u8] = b"tablesync-key-wrap-v1";

/// Source of this device's X25519 key pair.
///
/// The engine consumes a key pair; generating and storing the private half
/// is the caller's concern.
pub trait DeviceKeyPair: Send + Sync {
    /// The public half, published in this device's [`DeviceRecord`](tablesync_types::DeviceRecord).
    fn public_key(&self) -> [u8; 32];

    /// X25519 with `their_public`. Returns `None` for a non-contributory result.
    fn diffie_hellman(&self, their_public: &[u8; 32]) -> Option<[u8; 32]>;
}

/// In-process X25519 key pair.
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Build from an existing 32-byte private key.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl DeviceKeyPair for X25519KeyPair {
    fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    fn diffie_hellman(&self, their_public: &[u8; 32]) -> Option<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        shared.was_contributory().then(|| *shared.as_bytes())
    }
}

impl std::fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "X25519KeyPair {{ public: {}, secret: [REDACTED] }}",
            hex::encode(&self.public.as_bytes()[..8])
        )
    }
}

fn wrapping_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
    table: &str,
    key_version: KeyVersion,
) -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);

    let mut info = WRAP_INFO.to_vec();
    info.extend_from_slice(table.as_bytes());
    info.extend_from_slice(&key_version.value().to_be_bytes());

    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(okm)
}

/// Seal a table key to one device's public key.
pub fn wrap_key(
    table: &str,
    key_version: KeyVersion,
    key: &TableKey,
    device_id: DeviceId,
    recipient_public: &[u8; 32],
) -> Result<WrappedKey, CryptoError> {
    let mut ephemeral_bytes = [0u8; 32];
    fill_random(&mut ephemeral_bytes)?;
    let ephemeral = X25519KeyPair::from_secret_bytes(ephemeral_bytes);
    ephemeral_bytes.zeroize();

    let shared = ephemeral
        .diffie_hellman(recipient_public)
        .ok_or_else(|| CryptoError::KeyDerivationFailed("low-order public key".into()))?;
    let ephemeral_public = ephemeral.public_key();
    let mut kek = wrapping_key(&shared, &ephemeral_public, recipient_public, table, key_version)?;
    let sealed = seal_with(&kek, key.as_bytes(), device_id.as_bytes());
    kek.zeroize();
    let (nonce, sealed) = sealed?;

    Ok(WrappedKey {
        table: table.to_string(),
        key_version,
        device_id,
        ephemeral_public,
        nonce,
        sealed,
    })
}

/// Open a table key sealed to this device.
pub fn unwrap_key(
    keypair: &dyn DeviceKeyPair,
    device_id: DeviceId,
    wrapped: &WrappedKey,
) -> Result<TableKey, CryptoError> {
    if wrapped.device_id != device_id {
        return Err(CryptoError::WrongRecipient(wrapped.device_id));
    }
    let shared = keypair
        .diffie_hellman(&wrapped.ephemeral_public)
        .ok_or(CryptoError::DecryptionFailed)?;
    let mut kek = wrapping_key(
        &shared,
        &wrapped.ephemeral_public,
        &keypair.public_key(),
        &wrapped.table,
        wrapped.key_version,
    )?;
    let opened = open_with(&kek, &wrapped.nonce, &wrapped.sealed, device_id.as_bytes());
    kek.zeroize();
    TableKey::from_slice(&opened?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> X25519KeyPair {
        let mut bytes = [0u8; 32];
        fill_random(&mut bytes).unwrap();
        X25519KeyPair::from_secret_bytes(bytes)
    }

    // ===========================================
    // Argon2 Parameter Tests
    // ===========================================

    #[test]
    fn argon2_parameters_scale_with_ram() {
        let params_low = Argon2Params::for_ram_mb(1500);
        assert_eq!(params_low.memory_mib(), 12);
        assert_eq!(params_low.iterations(), 3);

        let params_mid = Argon2Params::for_ram_mb(3000);
        assert_eq!(params_mid.memory_mib(), 19);
        assert_eq!(params_mid.iterations(), 2);

        let params_high = Argon2Params::for_ram_mb(6000);
        assert_eq!(params_high.memory_mib(), 46);
        assert_eq!(params_high.iterations(), 1);

        let params_desktop = Argon2Params::for_ram_mb(16000);
        assert_eq!(params_desktop.memory_mib(), 64);
        assert_eq!(params_desktop.parallelism(), 4);
    }

    #[test]
    fn absurd_argon2_parameters_are_rejected() {
        let result = PasswordKey::derive("pw", b"0123456789abcdef", Argon2Params::new(4096, 1, 1));
        assert!(matches!(result, Err(CryptoError::KeyDerivationFailed(_))));
    }

    #[test]
    fn password_key_is_deterministic_per_salt() {
        let params = Argon2Params::new(1, 1, 1);
        let a = PasswordKey::derive("correct horse", b"salt-salt-salt-1", params).unwrap();
        let b = PasswordKey::derive("correct horse", b"salt-salt-salt-1", params).unwrap();
        let (nonce, ct) = a.seal(b"bundle").unwrap();
        assert_eq!(b.open(&nonce, &ct).unwrap(), b"bundle");

        let other = PasswordKey::derive("wrong horse", b"salt-salt-salt-1", params).unwrap();
        assert!(matches!(
            other.open(&nonce, &ct),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    // ===========================================
    // XChaCha20-Poly1305 Tests (192-bit nonces)
    // ===========================================

    #[test]
    fn table_key_seals_with_random_nonces() {
        let key = TableKey::generate().unwrap();
        let aad = entry_aad("notes", "k1", KeyVersion::new(1), false);

        let (n1, ct1) = key.seal(b"same", &aad).unwrap();
        let (n2, ct2) = key.seal(b"same", &aad).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
        assert_eq!(key.open(&n1, &ct1, &aad).unwrap(), b"same");
        assert_eq!(key.open(&n2, &ct2, &aad).unwrap(), b"same");
    }

    #[test]
    fn ciphertext_is_bound_to_its_row() {
        let key = TableKey::generate().unwrap();
        let aad = entry_aad("notes", "k1", KeyVersion::new(1), false);
        let (nonce, ct) = key.seal(b"payload", &aad).unwrap();

        let moved = entry_aad("notes", "k2", KeyVersion::new(1), false);
        assert!(matches!(
            key.open(&nonce, &ct, &moved),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_table_key_fails() {
        let aad = entry_aad("notes", "k1", KeyVersion::new(1), false);
        let (nonce, ct) = TableKey::generate().unwrap().seal(b"x", &aad).unwrap();
        assert!(TableKey::generate().unwrap().open(&nonce, &ct, &aad).is_err());
    }

    #[test]
    fn table_key_from_short_slice_fails() {
        assert!(matches!(
            TableKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = TableKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{:?}", key), "TableKey([REDACTED])");
        assert!(format!("{:?}", keypair()).contains("[REDACTED]"));
    }

    // ===========================================
    // Key Wrapping Tests
    // ===========================================

    #[test]
    fn wrapped_key_opens_for_recipient() {
        let device = keypair();
        let device_id = DeviceId::random();
        let key = TableKey::generate().unwrap();

        let wrapped =
            wrap_key("notes", KeyVersion::new(3), &key, device_id, &device.public_key()).unwrap();
        let opened = unwrap_key(&device, device_id, &wrapped).unwrap();
        assert_eq!(opened, key);
    }

    #[test]
    fn wrapped_key_does_not_open_for_other_device() {
        let device = keypair();
        let intruder = keypair();
        let device_id = DeviceId::random();
        let key = TableKey::generate().unwrap();
        let wrapped =
            wrap_key("notes", KeyVersion::new(1), &key, device_id, &device.public_key()).unwrap();

        assert!(matches!(
            unwrap_key(&intruder, device_id, &wrapped),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(
            unwrap_key(&device, DeviceId::random(), &wrapped),
            Err(CryptoError::WrongRecipient(_))
        ));
    }

    #[test]
    fn wrapped_key_is_bound_to_version() {
        let device = keypair();
        let device_id = DeviceId::random();
        let key = TableKey::generate().unwrap();
        let mut wrapped =
            wrap_key("notes", KeyVersion::new(1), &key, device_id, &device.public_key()).unwrap();
        wrapped.key_version = KeyVersion::new(2);
        assert!(unwrap_key(&device, device_id, &wrapped).is_err());
    }
}
