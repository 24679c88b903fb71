//! SQLite-backed key record store
//!
//! Records are append-only; the only mutation is the one-way flip of
//! `is_active` from 1 to 0. All statements use bound parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::{Mutex, MutexGuard};

use crate::domain::keys::{
    ActiveKeyFiles, ActiveKeyMetadata, EncryptedBlob, KeyError, KeyRecordStore, KeyRecordSummary,
    NewKeyRecord, RotationCommit, SecurityKeyRecord,
};

const SELECT_ACTIVE_SQL: &str = r#"
    SELECT * FROM security_key_records
    WHERE is_active = 1
    ORDER BY created_at DESC, id DESC
    LIMIT 1
"#;

/// SQLite-backed implementation of KeyRecordStore
///
/// Schema is owned by `storage::migrations`; this type assumes it exists.
#[derive(Debug, Clone)]
pub struct SqliteKeyRecordStore {
    pool: SqlitePool,
}

impl SqliteKeyRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: sqlx::sqlite::SqliteRow) -> SecurityKeyRecord {
        let private_blob: String = row.get("private_key_file_encrypted");
        let public_blob: String = row.get("public_key_file_encrypted");

        SecurityKeyRecord {
            id: row.get("id"),
            private_key_name: row.get("private_key_name"),
            public_key_name: row.get("public_key_name"),
            private_key_file_encrypted: EncryptedBlob::from_encoded(private_blob),
            public_key_file_encrypted: EncryptedBlob::from_encoded(public_blob),
            is_active: row.get("is_active"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            modified_by: row.get("modified_by"),
            modified_at: row.get("modified_at"),
        }
    }

    async fn fetch_active(&self) -> Result<SecurityKeyRecord, KeyError> {
        let row = sqlx::query(SELECT_ACTIVE_SQL)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KeyError::persistence("Failed to read active key record", e))?;

        match row {
            Some(r) => Ok(Self::row_to_record(r)),
            None => Err(KeyError::NotFound("no active key record".to_string())),
        }
    }
}

async fn insert_record(conn: &mut SqliteConnection, record: &NewKeyRecord) -> Result<i64, KeyError> {
    let result = sqlx::query(
        r#"
        INSERT INTO security_key_records (
            private_key_name, public_key_name,
            private_key_file_encrypted, public_key_file_encrypted,
            is_active, created_by, created_at
        )
        VALUES (?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&record.labels.private_key_name)
    .bind(&record.labels.public_key_name)
    .bind(record.private_key_file_encrypted.as_str())
    .bind(record.public_key_file_encrypted.as_str())
    .bind(&record.created_by)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| KeyError::persistence("Failed to insert key record", e))?;

    Ok(result.last_insert_rowid())
}

async fn deactivate_before(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    actor: &str,
) -> Result<u64, KeyError> {
    let result = sqlx::query(
        r#"
        UPDATE security_key_records
        SET is_active = 0, modified_by = ?, modified_at = ?
        WHERE is_active = 1 AND created_at < ?
        "#,
    )
    .bind(actor)
    .bind(Utc::now())
    .bind(cutoff)
    .execute(&mut *conn)
    .await
    .map_err(|e| KeyError::persistence("Failed to deactivate key records", e))?;

    Ok(result.rows_affected())
}

async fn deactivate_all_except(
    conn: &mut SqliteConnection,
    keep_id: i64,
    actor: &str,
) -> Result<u64, KeyError> {
    let result = sqlx::query(
        r#"
        UPDATE security_key_records
        SET is_active = 0, modified_by = ?, modified_at = ?
        WHERE is_active = 1 AND id <> ?
        "#,
    )
    .bind(actor)
    .bind(Utc::now())
    .bind(keep_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| KeyError::persistence("Failed to deactivate key records", e))?;

    Ok(result.rows_affected())
}

#[async_trait]
impl KeyRecordStore for SqliteKeyRecordStore {
    async fn insert(&self, record: &NewKeyRecord) -> Result<i64, KeyError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeyError::persistence("Failed to acquire connection", e))?;
        insert_record(&mut conn, record).await
    }

    async fn get_active_metadata(&self) -> Result<ActiveKeyMetadata, KeyError> {
        Ok(self.fetch_active().await?.metadata())
    }

    async fn get_active_key_files(&self) -> Result<ActiveKeyFiles, KeyError> {
        Ok(self.fetch_active().await?.key_files())
    }

    async fn deactivate_older_than(
        &self,
        cutoff: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, KeyError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeyError::persistence("Failed to acquire connection", e))?;
        deactivate_before(&mut conn, cutoff, actor).await
    }

    async fn active_record_ids(&self) -> Result<Vec<i64>, KeyError> {
        sqlx::query_scalar("SELECT id FROM security_key_records WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KeyError::persistence("Failed to read active key ids", e))
    }

    async fn commit_rotation(
        &self,
        record: &NewKeyRecord,
        expected_active: &[i64],
    ) -> Result<RotationCommit, KeyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeyError::persistence("Failed to begin rotation", e))?;

        // Writing first takes the database write lock for the rest of the
        // transaction, so the check below cannot go stale before commit.
        let record_id = insert_record(&mut tx, record).await?;

        let found: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM security_key_records WHERE is_active = 1 AND id <> ? ORDER BY id",
        )
        .bind(record_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| KeyError::persistence("Failed to read active key ids", e))?;

        let mut expected = expected_active.to_vec();
        expected.sort_unstable();
        if found != expected {
            tx.rollback()
                .await
                .map_err(|e| KeyError::persistence("Failed to roll back rotation", e))?;
            return Err(KeyError::RotationRaceDetected { expected, found });
        }

        // Retire exactly the verified set, whatever its timestamps say
        let deactivated = deactivate_all_except(&mut tx, record_id, &record.created_by).await?;

        tx.commit()
            .await
            .map_err(|e| KeyError::persistence("Failed to commit rotation", e))?;

        Ok(RotationCommit {
            record_id,
            deactivated,
        })
    }

    async fn list_records(&self) -> Result<Vec<KeyRecordSummary>, KeyError> {
        let rows = sqlx::query("SELECT * FROM security_key_records ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KeyError::persistence("Failed to list key records", e))?;

        Ok(rows
            .into_iter()
            .map(|r| Self::row_to_record(r).summary())
            .collect())
    }
}

/// In-memory key record store for testing
///
/// Mirrors the SQLite semantics, including id assignment and tie-break.
/// It should NOT be used in production.
#[derive(Debug, Default)]
pub struct InMemoryKeyRecordStore {
    records: Mutex<Vec<SecurityKeyRecord>>,
}

impl InMemoryKeyRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<SecurityKeyRecord>>, KeyError> {
        self.records
            .lock()
            .map_err(|_| KeyError::Persistence("in-memory store lock poisoned".to_string()))
    }

    fn push(records: &mut Vec<SecurityKeyRecord>, record: &NewKeyRecord) -> Result<i64, KeyError> {
        let duplicate = records.iter().any(|r| {
            r.private_key_name == record.labels.private_key_name
                || r.public_key_name == record.labels.public_key_name
        });
        if duplicate {
            return Err(KeyError::Persistence(format!(
                "UNIQUE constraint failed: {}",
                record.labels.public_key_name
            )));
        }

        let id = records.last().map_or(1, |r| r.id + 1);
        records.push(SecurityKeyRecord {
            id,
            private_key_name: record.labels.private_key_name.clone(),
            public_key_name: record.labels.public_key_name.clone(),
            private_key_file_encrypted: record.private_key_file_encrypted.clone(),
            public_key_file_encrypted: record.public_key_file_encrypted.clone(),
            is_active: true,
            created_by: record.created_by.clone(),
            created_at: record.created_at,
            modified_by: None,
            modified_at: None,
        });
        Ok(id)
    }

    fn sweep(
        records: &mut [SecurityKeyRecord],
        actor: &str,
        retire: impl Fn(&SecurityKeyRecord) -> bool,
    ) -> u64 {
        let now = Utc::now();
        let mut changed = 0;
        for record in records.iter_mut().filter(|r| r.is_active && retire(&**r)) {
            record.is_active = false;
            record.modified_by = Some(actor.to_string());
            record.modified_at = Some(now);
            changed += 1;
        }
        changed
    }

    fn active(records: &[SecurityKeyRecord]) -> Result<&SecurityKeyRecord, KeyError> {
        records
            .iter()
            .filter(|r| r.is_active)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .ok_or_else(|| KeyError::NotFound("no active key record".to_string()))
    }
}

#[async_trait]
impl KeyRecordStore for InMemoryKeyRecordStore {
    async fn insert(&self, record: &NewKeyRecord) -> Result<i64, KeyError> {
        Self::push(&mut *self.lock()?, record)
    }

    async fn get_active_metadata(&self) -> Result<ActiveKeyMetadata, KeyError> {
        Ok(Self::active(&*self.lock()?)?.metadata())
    }

    async fn get_active_key_files(&self) -> Result<ActiveKeyFiles, KeyError> {
        Ok(Self::active(&*self.lock()?)?.key_files())
    }

    async fn deactivate_older_than(
        &self,
        cutoff: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, KeyError> {
        Ok(Self::sweep(&mut *self.lock()?, actor, |r| r.created_at < cutoff))
    }

    async fn active_record_ids(&self) -> Result<Vec<i64>, KeyError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| r.is_active)
            .map(|r| r.id)
            .collect())
    }

    async fn commit_rotation(
        &self,
        record: &NewKeyRecord,
        expected_active: &[i64],
    ) -> Result<RotationCommit, KeyError> {
        let mut records = self.lock()?;

        let found: Vec<i64> = records.iter().filter(|r| r.is_active).map(|r| r.id).collect();
        let mut expected = expected_active.to_vec();
        expected.sort_unstable();
        if found != expected {
            return Err(KeyError::RotationRaceDetected { expected, found });
        }

        let record_id = Self::push(&mut *records, record)?;
        let deactivated =
            Self::sweep(records.as_mut_slice(), &record.created_by, |r| r.id != record_id);

        Ok(RotationCommit {
            record_id,
            deactivated,
        })
    }

    async fn list_records(&self) -> Result<Vec<KeyRecordSummary>, KeyError> {
        Ok(self.lock()?.iter().map(SecurityKeyRecord::summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keys::KeyLabels;
    use chrono::Duration;

    fn new_record(actor: &str, created_at: DateTime<Utc>) -> NewKeyRecord {
        NewKeyRecord {
            labels: KeyLabels::generate(),
            private_key_file_encrypted: EncryptedBlob::from_encoded("cHJpdmF0ZQ=="),
            public_key_file_encrypted: EncryptedBlob::from_encoded("cHVibGlj"),
            created_by: actor.to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_empty_is_not_found() {
        let store = InMemoryKeyRecordStore::new();

        assert!(store.get_active_metadata().await.unwrap_err().is_not_found());
        assert!(store.get_active_key_files().await.unwrap_err().is_not_found());
        assert!(store.active_record_ids().await.unwrap().is_empty());
        assert!(store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store_tie_break() {
        let store = InMemoryKeyRecordStore::new();
        let now = Utc::now();

        store.insert(&new_record("alice", now - Duration::seconds(10))).await.unwrap();
        let newest = store.insert(&new_record("bob", now)).await.unwrap();
        let same_time = store.insert(&new_record("carol", now)).await.unwrap();

        let active = store.get_active_metadata().await.unwrap();
        assert_ne!(active.id, newest);
        assert_eq!(active.id, same_time);
        assert_eq!(active.created_by, "carol");
    }

    #[tokio::test]
    async fn test_in_memory_store_sweep_is_idempotent() {
        let store = InMemoryKeyRecordStore::new();
        let now = Utc::now();

        store.insert(&new_record("alice", now - Duration::seconds(20))).await.unwrap();
        store.insert(&new_record("bob", now - Duration::seconds(10))).await.unwrap();
        store.insert(&new_record("carol", now)).await.unwrap();

        assert_eq!(store.deactivate_older_than(now, "carol").await.unwrap(), 2);
        assert_eq!(store.deactivate_older_than(now, "carol").await.unwrap(), 0);
        assert_eq!(store.active_record_ids().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_in_memory_commit_rejects_stale_snapshot() {
        let store = InMemoryKeyRecordStore::new();
        store.insert(&new_record("alice", Utc::now())).await.unwrap();

        let err = store
            .commit_rotation(&new_record("bob", Utc::now()), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeyError::RotationRaceDetected { ref expected, ref found } if expected.is_empty() && found == &vec![1]
        ));
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_commit_retires_predecessor_with_later_timestamp() {
        let store = InMemoryKeyRecordStore::new();
        let now = Utc::now();
        let first = store.insert(&new_record("alice", now)).await.unwrap();

        // Clock stepped backwards between rotations
        let commit = store
            .commit_rotation(&new_record("bob", now - Duration::seconds(1)), &[first])
            .await
            .unwrap();

        assert_eq!(commit.deactivated, 1);
        assert_eq!(store.active_record_ids().await.unwrap(), vec![commit.record_id]);
        assert_eq!(store.get_active_metadata().await.unwrap().created_by, "bob");
    }

    #[tokio::test]
    async fn test_in_memory_rejects_duplicate_labels() {
        let store = InMemoryKeyRecordStore::new();
        let record = new_record("alice", Utc::now());

        store.insert(&record).await.unwrap();
        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, KeyError::Persistence(_)));
    }
}
