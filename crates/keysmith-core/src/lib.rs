//! Keysmith Core Library
//!
//! This crate provides the core functionality for Keysmith, including:
//! - RSA key pair rotation with a single active generation
//! - Envelope encryption of key material under an AES-256-GCM master key
//! - Public key export for distribution
//! - Storage (SQLite with versioned migrations)
//! - Audit trail of lifecycle events
//! - Configuration and environment-only secrets

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, Secrets};
    pub use crate::domain::keys::{
        Actor, ExportedPublicKey, KeyError, KeyLabels, KeyLifecycleService, RotationStatus,
    };
    pub use crate::error::{Error, Result};
    pub use crate::storage::Database;
}
