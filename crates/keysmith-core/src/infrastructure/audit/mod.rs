//! Audit trail persistence

pub mod sqlite_audit_log;

pub use sqlite_audit_log::{InMemoryAuditLog, SqliteAuditLog};
