//! Error types for keysmith

use thiserror::Error;

use crate::domain::keys::KeyError;

/// Result type alias using keysmith's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Keysmith error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Key lifecycle errors (E100-E199)
    #[error(transparent)]
    Key(#[from] KeyError),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Required secret {0} is not set. Export it in the environment or a .env file.")]
    MissingSecret(&'static str),

    #[error("Secret {name} is invalid: {reason}")]
    InvalidSecret { name: &'static str, reason: String },

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    ///
    /// Key lifecycle errors keep their own `K` codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Key(e) => e.root_cause().code(),
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::MissingSecret(_) => "E601",
            Self::InvalidSecret { .. } => "E602",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Key(e) if e.is_not_found() => Some("keysmith rotate --actor <name>".to_string()),
            Self::Key(e) if matches!(e.root_cause(), KeyError::Decryption(_)) => {
                Some("Check that KEYSMITH_MASTER_KEY matches the key used to seal the records".to_string())
            }
            Self::Key(e) if matches!(e.root_cause(), KeyError::Timeout { .. }) => {
                Some("keysmith config get keys.operation_timeout_ms".to_string())
            }
            Self::MissingSecret(name) => Some(format!("export {}=<value>", name)),
            Self::ConfigError(_) => Some("keysmith config path".to_string()),
            Self::DatabaseError(_) => Some("keysmith doctor".to_string()),
            _ => None,
        }
    }

    /// The key lifecycle error behind this one, if any
    pub fn key_error(&self) -> Option<&KeyError> {
        match self {
            Self::Key(e) => Some(e),
            _ => None,
        }
    }
}
