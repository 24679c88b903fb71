//! Key subsystem errors
//!
//! Failure kinds stay distinguishable internally and collapse to a small,
//! stable set of external statuses at the boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during key lifecycle operations
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rotation race detected: expected active records {expected:?}, found {found:?}")]
    RotationRaceDetected { expected: Vec<i64>, found: Vec<i64> },

    #[error("Operation '{operation}' timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u128 },

    #[error("Key rotation failed: {0}")]
    RotationFailed(#[source] Box<KeyError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KeyError {
    /// Stable error code, safe to log and to record in the audit trail
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyGeneration(_) => "K100",
            Self::Encryption(_) => "K200",
            Self::Decryption(_) => "K201",
            Self::InvalidKeyLength { .. } => "K202",
            Self::InvalidFormat(_) => "K203",
            Self::Persistence(_) => "K300",
            Self::NotFound(_) => "K301",
            Self::RotationRaceDetected { .. } => "K302",
            Self::Timeout { .. } => "K303",
            Self::RotationFailed(_) => "K400",
            Self::Io(_) => "K900",
        }
    }

    /// The innermost error, unwrapping any `RotationFailed` layers
    pub fn root_cause(&self) -> &KeyError {
        match self {
            Self::RotationFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Coarse status exposed to callers
    pub fn status(&self) -> ExternalStatus {
        match self.root_cause() {
            Self::NotFound(_) => ExternalStatus::NotFound,
            _ => ExternalStatus::ServerError,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::NotFound(_))
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{}: {}", context, err))
    }
}

/// The external contract: a caller only ever sees one of these
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    NotFound,
    ServerError,
}

impl ExternalStatus {
    /// HTTP-equivalent status code
    pub fn http_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::ServerError => 500,
        }
    }
}

/// Body of the rotate response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStatus {
    Success,
    Error,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
        }
    }
}

impl<T> From<&Result<T, KeyError>> for RotationStatus {
    fn from(result: &Result<T, KeyError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Error,
        }
    }
}
