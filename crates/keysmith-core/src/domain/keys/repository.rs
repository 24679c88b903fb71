//! Key record store and audit sink traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entity::{ActiveKeyFiles, ActiveKeyMetadata, KeyRecordSummary, NewKeyRecord, RotationCommit};
use super::error::KeyError;
use super::event::AuditEntry;

/// Persistence boundary for key records
///
/// Every method is one round-trip to the backing store. When more than one
/// record is active, the read methods pick the newest `created_at`, then the
/// highest id.
#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    /// Append a record with `is_active = true`, returning its id
    async fn insert(&self, record: &NewKeyRecord) -> Result<i64, KeyError>;

    /// Labels and identity of the active record
    async fn get_active_metadata(&self) -> Result<ActiveKeyMetadata, KeyError>;

    /// Sealed payloads of the active record
    async fn get_active_key_files(&self) -> Result<ActiveKeyFiles, KeyError>;

    /// Deactivate every active record created strictly before `cutoff`
    ///
    /// Returns the number of records changed; a repeat call with the same
    /// cutoff returns 0.
    async fn deactivate_older_than(
        &self,
        cutoff: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, KeyError>;

    /// Ids of all active records, ascending
    async fn active_record_ids(&self) -> Result<Vec<i64>, KeyError>;

    /// Insert `record` and retire its predecessors in one transaction
    ///
    /// Fails with `RotationRaceDetected`, writing nothing, when the active set
    /// no longer equals `expected_active`. On success every other active
    /// record is retired regardless of its `created_at`.
    async fn commit_rotation(
        &self,
        record: &NewKeyRecord,
        expected_active: &[i64],
    ) -> Result<RotationCommit, KeyError>;

    /// Every record ever stored, ascending by id
    async fn list_records(&self) -> Result<Vec<KeyRecordSummary>, KeyError>;
}

/// Audit trail writer; callers treat failures as non-fatal
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), KeyError>;
}
