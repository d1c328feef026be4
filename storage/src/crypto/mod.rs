//! At-rest encryption for row payloads.
//!
//! Keys are derived with PBKDF2-HMAC-SHA3-256 from a passphrase and a salt
//! persisted next to the database. Payloads are sealed with AES-256-GCM
//! under a fresh random 96-bit nonce per call. With random nonces the
//! collision probability reaches the birthday bound after roughly 2^32
//! encryptions under one key; that volume is outside what this store is
//! built for and is an accepted limitation.

use crate::file::ensure_parent_dir;
use crate::{Result, StorageError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

pub const DEFAULT_KDF_ITERATIONS: u32 = 200_000;
pub const MIN_KDF_ITERATIONS: u32 = 200_000;

/// Derived key material; wiped from memory on drop.
pub struct SecretKey(Zeroizing<[u8; KEY_LEN]>);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(***)")
    }
}

/// PBKDF2-HMAC-SHA3-256 with a 32-byte output.
///
/// Deterministic in all three inputs, which is what lets a session reopen
/// data written by an earlier one.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> SecretKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha3_256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    SecretKey(key)
}

/// Reads the base64 salt at `path`, or generates and persists a new one.
pub fn load_or_create_salt(path: &Path) -> Result<[u8; SALT_LEN]> {
    if path.exists() {
        let text = fs::read_to_string(path)?;
        let decoded = BASE64
            .decode(text.trim())
            .map_err(|e| StorageError::InvalidSalt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let salt: [u8; SALT_LEN] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| StorageError::InvalidSalt {
                    path: path.to_path_buf(),
                    reason: format!("expected {} bytes, got {}", SALT_LEN, decoded.len()),
                })?;

        debug!("loaded salt from {}", path.display());
        return Ok(salt);
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    ensure_parent_dir(path)?;
    fs::write(path, BASE64.encode(salt))?;
    info!("generated new salt at {}", path.display());
    Ok(salt)
}

/// A sealed payload as stored in a page: `{"nonce": .., "ct": ..}`, both
/// fields base64. The ciphertext carries the GCM tag at its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(rename = "ct", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Authenticated encryption under a passphrase-derived key.
pub struct CryptoContext {
    cipher: Aes256Gcm,
    salt: [u8; SALT_LEN],
}

impl CryptoContext {
    pub fn new(passphrase: &str, salt: [u8; SALT_LEN], iterations: u32) -> Self {
        let key = derive_key(passphrase, &salt, iterations);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher, salt }
    }

    /// Builds a context from the salt file at `salt_path`, creating it on
    /// first use.
    pub fn open(passphrase: &str, salt_path: &Path, iterations: u32) -> Result<Self> {
        let salt = load_or_create_salt(salt_path)?;
        Ok(Self::new(passphrase, salt, iterations))
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn salt_base64(&self) -> String {
        BASE64.encode(self.salt)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        // aes-gcm only refuses inputs beyond its 64 GiB limit
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::OversizedPayload {
                size: plaintext.len(),
                max: crate::page::PAGE_SIZE,
            })?;

        Ok(Envelope {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.nonce.len() != NONCE_LEN {
            return Err(StorageError::AuthenticationFailure);
        }

        self.cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| StorageError::AuthenticationFailure)
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("salt", &self.salt_base64())
            .finish_non_exhaustive()
    }
}
