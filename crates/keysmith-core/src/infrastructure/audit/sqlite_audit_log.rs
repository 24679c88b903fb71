//! SQLite-backed audit log

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Mutex;

use crate::domain::keys::{AuditAction, AuditEntry, AuditSink, KeyError};

/// Appends audit entries to the `audit_log` table
#[derive(Debug, Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: u32) -> Result<Vec<AuditEntry>, KeyError> {
        let rows = sqlx::query(
            "SELECT actor, action, detail, created_at FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeyError::persistence("Failed to read audit log", e))?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<AuditEntry, KeyError> {
        let action: String = row.get("action");
        let detail: String = row.get("detail");

        Ok(AuditEntry {
            actor: row.get("actor"),
            action: serde_json::from_value(serde_json::Value::String(action))
                .map_err(|e| KeyError::InvalidFormat(format!("Unknown audit action: {}", e)))?,
            detail: serde_json::from_str(&detail)
                .map_err(|e| KeyError::InvalidFormat(format!("Invalid audit detail: {}", e)))?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<(), KeyError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor, action, detail, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(entry.detail.to_string())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| KeyError::persistence("Failed to write audit entry", e))?;

        Ok(())
    }
}

/// In-memory audit sink for testing
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry recorded so far, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.entries().iter().filter(|e| e.action == action).count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<(), KeyError> {
        self.entries
            .lock()
            .map_err(|_| KeyError::Persistence("in-memory audit lock poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}
