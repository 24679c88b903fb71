//! Key lifecycle domain module
//!
//! Rotates an RSA key pair and keeps every generation in the store, with
//! exactly one generation marked active.
//!
//! # Architecture
//!
//! - **Entities**: `SecurityKeyRecord`, `KeyLabels`, `KeyMaterial`, `SecureString`
//! - **Cipher**: `SymmetricCipher` sealing armored keys under a `MasterKey`
//! - **Generator**: `KeyPairGenerator` trait, `RsaKeyPairGenerator`
//! - **Repository Traits**: `KeyRecordStore`, `AuditSink`
//! - **Services**: `KeyLifecycleService` for rotation, lookup and export
//!
//! # Security Features
//!
//! - AES-256-GCM authenticated encryption with a fresh nonce per seal
//! - Private half is an OpenPGP secret key locked by a passphrase before sealing
//! - Secure memory handling with zeroize-on-drop
//! - No read path ever decrypts the private half
//!
//! # Example
//!
//! ```ignore
//! use keysmith_core::domain::keys::{Actor, KeyLifecycleService, MasterKey, RsaKeyPairGenerator, SymmetricCipher};
//! use keysmith_core::infrastructure::{audit::SqliteAuditLog, keys::SqliteKeyRecordStore};
//!
//! let service = KeyLifecycleService::new(
//!     Arc::new(RsaKeyPairGenerator::new(4096, passphrase)?),
//!     SymmetricCipher::new(&master_key),
//!     Arc::new(SqliteKeyRecordStore::new(pool.clone())),
//!     Arc::new(SqliteAuditLog::new(pool)),
//! );
//!
//! service.rotate(&Actor::new("alice")).await?;
//! let public_key = service.export_active_public_key().await?;
//! ```

pub mod cipher;
pub mod entity;
pub mod error;
pub mod event;
pub mod generator;
pub mod repository;
pub mod service;

pub use cipher::{EncryptedBlob, MasterKey, SymmetricCipher};

pub use entity::{
    ActiveKeyFiles, ActiveKeyMetadata, Actor, ExportedPublicKey, KeyLabels, KeyMaterial,
    KeyRecordSummary, NewKeyRecord, RotationCommit, RotationReceipt, SecureString,
    SecurityKeyRecord,
};

pub use error::{ExternalStatus, KeyError, RotationStatus};

pub use event::{AuditAction, AuditEntry};

pub use generator::{KeyPairGenerator, RsaKeyPairGenerator};

pub use repository::{AuditSink, KeyRecordStore};

pub use service::{KeyLifecycleService, RotationPolicy};
