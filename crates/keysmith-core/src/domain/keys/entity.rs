//! Key lifecycle entities
//!
//! A `SecurityKeyRecord` is one generation of the RSA key pair, stored with
//! both halves sealed under the master key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cipher::EncryptedBlob;

/// Prefix of the private artifact label
pub const PRIVATE_KEY_PREFIX: &str = "CPR_";

/// Prefix of the public artifact label
pub const PUBLIC_KEY_PREFIX: &str = "CPU_";

/// Extension shared by both artifact labels
pub const KEY_FILE_EXTENSION: &str = ".asc";

/// A string that is securely zeroed when dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureString")
            .field("inner", &"[REDACTED]")
            .finish()
    }
}

impl AsRef<str> for SecureString {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

/// A freshly generated key pair in armored form
///
/// Transient: it is sealed and dropped within a single rotation.
#[derive(Debug)]
pub struct KeyMaterial {
    pub private_key_armored: SecureString,
    pub public_key_armored: String,
}

/// Who asked for an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// The pair of artifact names for one key generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyLabels {
    pub private_key_name: String,
    pub public_key_name: String,
}

impl KeyLabels {
    /// Derive both labels from a single random v4 UUID
    pub fn generate() -> Self {
        Self::from_token(Uuid::new_v4())
    }

    pub fn from_token(token: Uuid) -> Self {
        Self {
            private_key_name: format!("{}{}{}", PRIVATE_KEY_PREFIX, token, KEY_FILE_EXTENSION),
            public_key_name: format!("{}{}{}", PUBLIC_KEY_PREFIX, token, KEY_FILE_EXTENSION),
        }
    }
}

/// A record about to be inserted; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewKeyRecord {
    pub labels: KeyLabels,
    pub private_key_file_encrypted: EncryptedBlob,
    pub public_key_file_encrypted: EncryptedBlob,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted key record, all columns
#[derive(Debug, Clone)]
pub struct SecurityKeyRecord {
    pub id: i64,
    pub private_key_name: String,
    pub public_key_name: String,
    pub private_key_file_encrypted: EncryptedBlob,
    pub public_key_file_encrypted: EncryptedBlob,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl SecurityKeyRecord {
    pub fn labels(&self) -> KeyLabels {
        KeyLabels {
            private_key_name: self.private_key_name.clone(),
            public_key_name: self.public_key_name.clone(),
        }
    }

    pub fn metadata(&self) -> ActiveKeyMetadata {
        ActiveKeyMetadata {
            id: self.id,
            labels: self.labels(),
            is_active: self.is_active,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
        }
    }

    pub fn key_files(&self) -> ActiveKeyFiles {
        ActiveKeyFiles {
            labels: self.labels(),
            private_key_file_encrypted: self.private_key_file_encrypted.clone(),
            public_key_file_encrypted: self.public_key_file_encrypted.clone(),
        }
    }

    pub fn summary(&self) -> KeyRecordSummary {
        KeyRecordSummary {
            id: self.id,
            labels: self.labels(),
            is_active: self.is_active,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            modified_by: self.modified_by.clone(),
            modified_at: self.modified_at,
        }
    }
}

/// Label and identity projection of the active record; never key bytes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveKeyMetadata {
    pub id: i64,
    #[serde(flatten)]
    pub labels: KeyLabels,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Payload projection of the active record
#[derive(Debug, Clone)]
pub struct ActiveKeyFiles {
    pub labels: KeyLabels,
    pub private_key_file_encrypted: EncryptedBlob,
    pub public_key_file_encrypted: EncryptedBlob,
}

/// History row, everything but the sealed payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecordSummary {
    pub id: i64,
    #[serde(flatten)]
    pub labels: KeyLabels,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of a committed rotation transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationCommit {
    pub record_id: i64,
    pub deactivated: u64,
}

/// What `rotate` hands back; deliberately carries no key material
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReceipt {
    pub record_id: i64,
    #[serde(flatten)]
    pub labels: KeyLabels,
    pub created_at: DateTime<Utc>,
    pub deactivated: u64,
    pub attempts: u32,
}

/// The decrypted public half of the active key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPublicKey {
    pub file_name: String,
    pub armored: String,
}

impl ExportedPublicKey {
    /// Write the artifact as `dir/<file_name>`, refusing to overwrite
    pub fn write_once(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let file_name = Path::new(&self.file_name)
            .file_name()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid artifact name: {}", self.file_name),
                )
            })?;
        let path = dir.join(file_name);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(self.armored.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}
