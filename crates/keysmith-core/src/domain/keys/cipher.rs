//! Envelope cipher for key material at rest
//!
//! AES-256-GCM under a process-wide master key. A blob is
//! `base64(nonce || ciphertext || tag)` and carries everything needed to
//! decrypt it except the key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::entity::SecureString;
use super::error::KeyError;

/// Size of AES-256 key in bytes
pub const AES_KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// The symmetric master key, zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; AES_KEY_SIZE],
}

impl MasterKey {
    /// Generate a new random master key
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create a master key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != AES_KEY_SIZE {
            return Err(KeyError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key_bytes = [0u8; AES_KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Create a master key from a hex-encoded string
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(encoded).map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Create a master key from a base64-encoded string
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut bytes = STANDARD
            .decode(encoded)
            .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Parse a configured key value: 64 hex characters, or base64
    pub fn parse(encoded: &str) -> Result<Self, KeyError> {
        let trimmed = encoded.trim();
        if trimmed.len() == AES_KEY_SIZE * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            Self::from_hex(trimmed)
        } else {
            Self::from_base64(trimmed)
        }
    }

    /// Export key as base64 string
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Transport-safe ciphertext produced by [`SymmetricCipher::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    /// Wrap an encoded blob read back from storage
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated symmetric cipher bound to one master key
///
/// Build it once at startup and share it; the key schedule is computed at
/// construction, never per call.
#[derive(Clone)]
pub struct SymmetricCipher {
    cipher: Aes256Gcm,
}

impl SymmetricCipher {
    pub fn new(master_key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(master_key.as_bytes().into()),
        }
    }

    /// Encrypt under a fresh random nonce
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, KeyError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        self.seal(plaintext, nonce)
    }

    /// Encrypt under a caller-chosen nonce, deterministic for a given input
    #[cfg(test)]
    pub(crate) fn encrypt_with_nonce(
        &self,
        plaintext: &str,
        nonce: [u8; NONCE_SIZE],
    ) -> Result<EncryptedBlob, KeyError> {
        self.seal(plaintext, nonce)
    }

    fn seal(&self, plaintext: &str, nonce_bytes: [u8; NONCE_SIZE]) -> Result<EncryptedBlob, KeyError> {
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| KeyError::Encryption(e.to_string()))?;

        let mut bytes = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        bytes.extend_from_slice(&nonce_bytes);
        bytes.extend_from_slice(&ciphertext);
        Ok(EncryptedBlob(STANDARD.encode(&bytes)))
    }

    /// Decrypt and authenticate a blob
    ///
    /// Never returns plaintext for a blob that was altered or sealed under a
    /// different key.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<SecureString, KeyError> {
        let bytes = STANDARD
            .decode(blob.as_str())
            .map_err(|e| KeyError::Decryption(format!("Invalid encoding: {}", e)))?;

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyError::Decryption(format!(
                "Blob too short: expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                bytes.len()
            )));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut plaintext = self.cipher.decrypt(nonce, ciphertext).map_err(|_| {
            KeyError::Decryption("Decryption failed (invalid key or corrupted data)".to_string())
        })?;

        match String::from_utf8(std::mem::take(&mut plaintext)) {
            Ok(decrypted) => Ok(SecureString::new(decrypted)),
            Err(e) => {
                let mut raw = e.into_bytes();
                raw.zeroize();
                Err(KeyError::Decryption("Plaintext is not valid UTF-8".to_string()))
            }
        }
    }
}

impl std::fmt::Debug for SymmetricCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish()
    }
}
