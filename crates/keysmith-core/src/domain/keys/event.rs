//! Audit entries for key lifecycle activity
//!
//! Entries carry labels, ids and error codes only. Key material and
//! passphrases never appear here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Actor, KeyLabels, RotationReceipt};
use super::error::KeyError;

/// Actor recorded for operations with no requesting identity
pub const SYSTEM_ACTOR: &str = "system";

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    KeyRotated,
    RotationFailed,
    PublicKeyExported,
    DecryptionFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyRotated => "key_rotated",
            Self::RotationFailed => "rotation_failed",
            Self::PublicKeyExported => "public_key_exported",
            Self::DecryptionFailed => "decryption_failed",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: AuditAction,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: AuditAction, detail: serde_json::Value) -> Self {
        Self {
            actor: actor.into(),
            action,
            detail,
            created_at: Utc::now(),
        }
    }

    pub fn key_rotated(actor: &Actor, receipt: &RotationReceipt) -> Self {
        let detail = serde_json::json!({
            "record_id": receipt.record_id,
            "private_key_name": receipt.labels.private_key_name,
            "public_key_name": receipt.labels.public_key_name,
            "deactivated": receipt.deactivated,
            "attempts": receipt.attempts,
            "role": actor.role,
        });
        Self::new(actor.id.clone(), AuditAction::KeyRotated, detail)
    }

    pub fn rotation_failed(actor: &Actor, error: &KeyError) -> Self {
        let detail = serde_json::json!({
            "error_code": error.root_cause().code(),
            "role": actor.role,
        });
        Self::new(actor.id.clone(), AuditAction::RotationFailed, detail)
    }

    pub fn public_key_exported(labels: &KeyLabels) -> Self {
        let detail = serde_json::json!({ "public_key_name": labels.public_key_name });
        Self::new(SYSTEM_ACTOR, AuditAction::PublicKeyExported, detail)
    }

    pub fn decryption_failed(labels: &KeyLabels, error: &KeyError) -> Self {
        let detail = serde_json::json!({
            "public_key_name": labels.public_key_name,
            "error_code": error.code(),
        });
        Self::new(SYSTEM_ACTOR, AuditAction::DecryptionFailed, detail)
    }
}
