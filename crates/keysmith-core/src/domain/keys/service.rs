//! Key lifecycle service
//!
//! Coordinates generator, cipher and store. Holds no state of its own beyond
//! its collaborators and policy.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{
    cipher::SymmetricCipher,
    entity::{Actor, ExportedPublicKey, KeyLabels, KeyMaterial, KeyRecordSummary, NewKeyRecord, RotationReceipt},
    error::KeyError,
    event::AuditEntry,
    generator::KeyPairGenerator,
    repository::{AuditSink, KeyRecordStore},
};

/// Default number of commit attempts when a concurrent rotation interferes
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default bound on a single store call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry and timeout bounds for service operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_attempts: u32,
    pub operation_timeout: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Service for rotating and distributing the RSA key pair
///
/// # Security Model
///
/// - A fresh RSA pair is generated on every rotation
/// - Both halves are sealed independently with AES-256-GCM before storage
/// - Only the public half is ever decrypted on the read path
/// - Key material is never logged or returned from `rotate`
///
/// # Example
///
/// ```ignore
/// let service = KeyLifecycleService::new(generator, cipher, store, audit);
///
/// let receipt = service.rotate(&Actor::new("alice").with_role("admin")).await?;
/// let labels = service.get_active_key_labels().await?;
/// let public_key = service.export_active_public_key().await?;
/// ```
pub struct KeyLifecycleService {
    generator: Arc<dyn KeyPairGenerator>,
    cipher: SymmetricCipher,
    store: Arc<dyn KeyRecordStore>,
    audit: Arc<dyn AuditSink>,
    policy: RotationPolicy,
}

impl KeyLifecycleService {
    pub fn new(
        generator: Arc<dyn KeyPairGenerator>,
        cipher: SymmetricCipher,
        store: Arc<dyn KeyRecordStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            generator,
            cipher,
            store,
            audit,
            policy: RotationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Generate, seal and persist a new key pair, retiring its predecessors
    ///
    /// Any failure is reported as `KeyError::RotationFailed` wrapping the
    /// step that failed.
    pub async fn rotate(&self, actor: &Actor) -> Result<RotationReceipt, KeyError> {
        let result = self
            .try_rotate(actor)
            .await
            .map_err(|e| KeyError::RotationFailed(Box::new(e)));

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    actor = %actor.id,
                    record_id = receipt.record_id,
                    public_key_name = %receipt.labels.public_key_name,
                    deactivated = receipt.deactivated,
                    attempts = receipt.attempts,
                    "Rotated RSA key pair"
                );
                self.audit(AuditEntry::key_rotated(actor, receipt)).await;
            }
            Err(e) => {
                let cause = e.root_cause();
                tracing::error!(
                    actor = %actor.id,
                    code = cause.code(),
                    error = %cause,
                    "Key rotation failed"
                );
                self.audit(AuditEntry::rotation_failed(actor, e)).await;
            }
        }

        result
    }

    async fn try_rotate(&self, actor: &Actor) -> Result<RotationReceipt, KeyError> {
        let material = self.generate().await?;
        let private_key_file_encrypted = self.cipher.encrypt(material.private_key_armored.as_str())?;
        let public_key_file_encrypted = self.cipher.encrypt(&material.public_key_armored)?;
        drop(material);

        let labels = KeyLabels::generate();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let expected = self
                .bounded("active_record_ids", self.store.active_record_ids())
                .await?;
            let record = NewKeyRecord {
                labels: labels.clone(),
                private_key_file_encrypted: private_key_file_encrypted.clone(),
                public_key_file_encrypted: public_key_file_encrypted.clone(),
                created_by: actor.id.clone(),
                created_at: Utc::now(),
            };

            match self
                .bounded("commit_rotation", self.store.commit_rotation(&record, &expected))
                .await
            {
                Ok(commit) => {
                    return Ok(RotationReceipt {
                        record_id: commit.record_id,
                        labels,
                        created_at: record.created_at,
                        deactivated: commit.deactivated,
                        attempts: attempt,
                    });
                }
                Err(err @ KeyError::RotationRaceDetected { .. })
                    if attempt < self.policy.max_attempts =>
                {
                    tracing::warn!(attempt, error = %err, "Concurrent rotation detected, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn generate(&self) -> Result<KeyMaterial, KeyError> {
        let generator = Arc::clone(&self.generator);

        // RSA generation is CPU-bound
        tokio::task::spawn_blocking(move || generator.generate_key_pair())
            .await
            .map_err(|e| KeyError::KeyGeneration(format!("Task join error: {}", e)))?
    }

    /// Labels of the active key pair
    pub async fn get_active_key_labels(&self) -> Result<KeyLabels, KeyError> {
        let metadata = self
            .bounded("get_active_metadata", self.store.get_active_metadata())
            .await?;
        Ok(metadata.labels)
    }

    /// Decrypt the public half of the active key pair for distribution
    ///
    /// There is intentionally no counterpart for the private half.
    pub async fn export_active_public_key(&self) -> Result<ExportedPublicKey, KeyError> {
        let files = self
            .bounded("get_active_key_files", self.store.get_active_key_files())
            .await?;

        match self.cipher.decrypt(&files.public_key_file_encrypted) {
            Ok(plaintext) => {
                tracing::info!(public_key_name = %files.labels.public_key_name, "Exported public key");
                self.audit(AuditEntry::public_key_exported(&files.labels)).await;
                Ok(ExportedPublicKey {
                    file_name: files.labels.public_key_name.clone(),
                    armored: plaintext.as_str().to_owned(),
                })
            }
            Err(e) => {
                tracing::error!(
                    public_key_name = %files.labels.public_key_name,
                    code = e.code(),
                    "Failed to decrypt active public key"
                );
                self.audit(AuditEntry::decryption_failed(&files.labels, &e)).await;
                Err(e)
            }
        }
    }

    /// All key generations, oldest first
    pub async fn key_history(&self) -> Result<Vec<KeyRecordSummary>, KeyError> {
        self.bounded("list_records", self.store.list_records()).await
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, KeyError>
    where
        F: Future<Output = Result<T, KeyError>>,
    {
        match tokio::time::timeout(self.policy.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(KeyError::Timeout {
                operation,
                millis: self.policy.operation_timeout.as_millis(),
            }),
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.bounded("audit", self.audit.record(&entry)).await {
            tracing::warn!(action = %entry.action, error = %e, "Failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keys::cipher::MasterKey;
    use crate::domain::keys::entity::{ActiveKeyFiles, ActiveKeyMetadata, RotationCommit, SecureString};
    use crate::domain::keys::event::AuditAction;
    use crate::infrastructure::audit::InMemoryAuditLog;
    use crate::infrastructure::keys::InMemoryKeyRecordStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    // Deterministic stand-in; real RSA generation is covered in generator.rs
    struct FakeKeyPairGenerator {
        counter: AtomicUsize,
    }

    impl FakeKeyPairGenerator {
        fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
            }
        }
    }

    impl KeyPairGenerator for FakeKeyPairGenerator {
        fn generate_key_pair(&self) -> Result<KeyMaterial, KeyError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(KeyMaterial {
                private_key_armored: SecureString::new(format!("PRIVATE-{}", n)),
                public_key_armored: format!("-----BEGIN PUBLIC KEY-----\nPUBLIC-{}\n-----END PUBLIC KEY-----\n", n),
            })
        }
    }

    struct FailingGenerator;

    impl KeyPairGenerator for FailingGenerator {
        fn generate_key_pair(&self) -> Result<KeyMaterial, KeyError> {
            Err(KeyError::KeyGeneration("entropy source unavailable".into()))
        }
    }

    struct FailingAuditSink;

    #[async_trait]
    impl AuditSink for FailingAuditSink {
        async fn record(&self, _entry: &AuditEntry) -> Result<(), KeyError> {
            Err(KeyError::Persistence("audit table missing".into()))
        }
    }

    /// Simulates another rotation committing between snapshot and commit
    struct RacingStore {
        inner: InMemoryKeyRecordStore,
        interference_left: AtomicU32,
    }

    impl RacingStore {
        fn new(interference: u32) -> Self {
            Self {
                inner: InMemoryKeyRecordStore::new(),
                interference_left: AtomicU32::new(interference),
            }
        }
    }

    #[async_trait]
    impl KeyRecordStore for RacingStore {
        async fn insert(&self, record: &NewKeyRecord) -> Result<i64, KeyError> {
            self.inner.insert(record).await
        }

        async fn get_active_metadata(&self) -> Result<ActiveKeyMetadata, KeyError> {
            self.inner.get_active_metadata().await
        }

        async fn get_active_key_files(&self) -> Result<ActiveKeyFiles, KeyError> {
            self.inner.get_active_key_files().await
        }

        async fn deactivate_older_than(
            &self,
            cutoff: DateTime<Utc>,
            actor: &str,
        ) -> Result<u64, KeyError> {
            self.inner.deactivate_older_than(cutoff, actor).await
        }

        async fn active_record_ids(&self) -> Result<Vec<i64>, KeyError> {
            self.inner.active_record_ids().await
        }

        async fn commit_rotation(
            &self,
            record: &NewKeyRecord,
            expected_active: &[i64],
        ) -> Result<RotationCommit, KeyError> {
            let interfere = self
                .interference_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if interfere {
                let intruder = NewKeyRecord {
                    labels: KeyLabels::generate(),
                    created_by: "mallory".into(),
                    created_at: Utc::now(),
                    ..record.clone()
                };
                self.inner.insert(&intruder).await?;
            }
            self.inner.commit_rotation(record, expected_active).await
        }

        async fn list_records(&self) -> Result<Vec<KeyRecordSummary>, KeyError> {
            self.inner.list_records().await
        }
    }

    struct StalledStore;

    #[async_trait]
    impl KeyRecordStore for StalledStore {
        async fn insert(&self, _record: &NewKeyRecord) -> Result<i64, KeyError> {
            unreachable!()
        }

        async fn get_active_metadata(&self) -> Result<ActiveKeyMetadata, KeyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(KeyError::NotFound("never".into()))
        }

        async fn get_active_key_files(&self) -> Result<ActiveKeyFiles, KeyError> {
            unreachable!()
        }

        async fn deactivate_older_than(
            &self,
            _cutoff: DateTime<Utc>,
            _actor: &str,
        ) -> Result<u64, KeyError> {
            unreachable!()
        }

        async fn active_record_ids(&self) -> Result<Vec<i64>, KeyError> {
            unreachable!()
        }

        async fn commit_rotation(
            &self,
            _record: &NewKeyRecord,
            _expected_active: &[i64],
        ) -> Result<RotationCommit, KeyError> {
            unreachable!()
        }

        async fn list_records(&self) -> Result<Vec<KeyRecordSummary>, KeyError> {
            unreachable!()
        }
    }

    struct Harness {
        service: KeyLifecycleService,
        store: Arc<InMemoryKeyRecordStore>,
        audit: Arc<InMemoryAuditLog>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryKeyRecordStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let service = KeyLifecycleService::new(
            Arc::new(FakeKeyPairGenerator::new()),
            SymmetricCipher::new(&MasterKey::generate()),
            store.clone(),
            audit.clone(),
        );
        Harness { service, store, audit }
    }

    #[tokio::test]
    async fn test_first_rotation_creates_active_record() {
        let h = harness();

        let receipt = h.service.rotate(&Actor::new("alice")).await.unwrap();
        assert_eq!(receipt.deactivated, 0);
        assert_eq!(receipt.attempts, 1);

        let records = h.store.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_active);
        assert_eq!(records[0].created_by, "alice");

        let labels = h.service.get_active_key_labels().await.unwrap();
        assert_eq!(labels, receipt.labels);
        assert_eq!(labels, records[0].labels);
    }

    #[tokio::test]
    async fn test_second_rotation_retires_first() {
        let h = harness();

        h.service.rotate(&Actor::new("alice")).await.unwrap();
        let receipt = h.service.rotate(&Actor::new("bob")).await.unwrap();
        assert_eq!(receipt.deactivated, 1);

        let records = h.store.list_records().await.unwrap();
        assert_eq!(records.len(), 2);

        assert!(!records[0].is_active);
        assert_eq!(records[0].created_by, "alice");
        assert_eq!(records[0].modified_by.as_deref(), Some("bob"));
        assert!(records[0].modified_at.is_some());

        assert!(records[1].is_active);
        assert_eq!(records[1].created_by, "bob");
        assert!(records[1].modified_by.is_none());
    }

    #[tokio::test]
    async fn test_many_rotations_keep_single_active_and_full_history() {
        let h = harness();
        let mut last = None;

        for i in 0..6 {
            last = Some(h.service.rotate(&Actor::new(format!("admin-{}", i))).await.unwrap());
        }

        let records = h.store.list_records().await.unwrap();
        assert_eq!(records.len(), 6);

        let active: Vec<_> = records.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, last.unwrap().record_id);
        assert_eq!(active[0].id, records.iter().map(|r| r.id).max().unwrap());
    }

    #[tokio::test]
    async fn test_rotation_stores_only_ciphertext() {
        let h = harness();
        h.service.rotate(&Actor::new("alice")).await.unwrap();

        let files = h.store.get_active_key_files().await.unwrap();
        assert!(!files.private_key_file_encrypted.as_str().contains("PRIVATE-1"));
        assert!(!files.public_key_file_encrypted.as_str().contains("PUBLIC-1"));
        assert_ne!(files.private_key_file_encrypted, files.public_key_file_encrypted);
    }

    #[tokio::test]
    async fn test_export_returns_generated_public_key() {
        let h = harness();
        let receipt = h.service.rotate(&Actor::new("alice")).await.unwrap();

        let export = h.service.export_active_public_key().await.unwrap();
        assert_eq!(export.file_name, receipt.labels.public_key_name);
        assert_eq!(
            export.armored,
            "-----BEGIN PUBLIC KEY-----\nPUBLIC-1\n-----END PUBLIC KEY-----\n"
        );

        let entries = h.audit.entries();
        assert_eq!(entries.last().unwrap().action, AuditAction::PublicKeyExported);
    }

    #[tokio::test]
    async fn test_empty_store_is_not_found() {
        let h = harness();

        let err = h.service.get_active_key_labels().await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status().http_code(), 404);

        let err = h.service.export_active_public_key().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_generation_failure_persists_nothing() {
        let store = Arc::new(InMemoryKeyRecordStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let service = KeyLifecycleService::new(
            Arc::new(FailingGenerator),
            SymmetricCipher::new(&MasterKey::generate()),
            store.clone(),
            audit.clone(),
        );

        let err = service.rotate(&Actor::new("alice")).await.unwrap_err();
        assert!(matches!(err, KeyError::RotationFailed(_)));
        assert!(matches!(err.root_cause(), KeyError::KeyGeneration(_)));
        assert!(store.list_records().await.unwrap().is_empty());

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::RotationFailed);
        assert_eq!(entries[0].detail["error_code"], "K100");
    }

    #[tokio::test]
    async fn test_race_is_retried() {
        let store = Arc::new(RacingStore::new(1));
        let service = KeyLifecycleService::new(
            Arc::new(FakeKeyPairGenerator::new()),
            SymmetricCipher::new(&MasterKey::generate()),
            store.clone(),
            Arc::new(InMemoryAuditLog::new()),
        );

        let receipt = service.rotate(&Actor::new("alice")).await.unwrap();
        assert_eq!(receipt.attempts, 2);
        assert_eq!(receipt.deactivated, 1);

        let records = store.list_records().await.unwrap();
        assert_eq!(records.len(), 2);
        let active: Vec<_> = records.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, receipt.record_id);
        assert!(records.iter().any(|r| r.created_by == "mallory" && !r.is_active));
    }

    #[tokio::test]
    async fn test_race_gives_up_after_max_attempts() {
        let store = Arc::new(RacingStore::new(u32::MAX));
        let service = KeyLifecycleService::new(
            Arc::new(FakeKeyPairGenerator::new()),
            SymmetricCipher::new(&MasterKey::generate()),
            store.clone(),
            Arc::new(InMemoryAuditLog::new()),
        )
        .with_policy(RotationPolicy {
            max_attempts: 2,
            ..RotationPolicy::default()
        });

        let err = service.rotate(&Actor::new("alice")).await.unwrap_err();
        assert!(matches!(err.root_cause(), KeyError::RotationRaceDetected { .. }));
        assert!(store
            .list_records()
            .await
            .unwrap()
            .iter()
            .all(|r| r.created_by == "mallory"));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_rotation() {
        let store = Arc::new(InMemoryKeyRecordStore::new());
        let service = KeyLifecycleService::new(
            Arc::new(FakeKeyPairGenerator::new()),
            SymmetricCipher::new(&MasterKey::generate()),
            store.clone(),
            Arc::new(FailingAuditSink),
        );

        service.rotate(&Actor::new("alice")).await.unwrap();
        service.export_active_public_key().await.unwrap();
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_audit_trail() {
        let h = harness();
        let receipt = h
            .service
            .rotate(&Actor::new("alice").with_role("key-admin"))
            .await
            .unwrap();

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor, "alice");
        assert_eq!(entries[0].action, AuditAction::KeyRotated);
        assert_eq!(entries[0].detail["record_id"], receipt.record_id);
        assert_eq!(entries[0].detail["role"], "key-admin");
    }

    #[tokio::test]
    async fn test_corrupted_public_blob_is_server_error() {
        let h = harness();
        let other_cipher = SymmetricCipher::new(&MasterKey::generate());

        // Sealed under a different master key than the service holds
        h.store
            .insert(&NewKeyRecord {
                labels: KeyLabels::generate(),
                private_key_file_encrypted: other_cipher.encrypt("private").unwrap(),
                public_key_file_encrypted: other_cipher.encrypt("public").unwrap(),
                created_by: "alice".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = h.service.export_active_public_key().await.unwrap_err();
        assert!(matches!(err, KeyError::Decryption(_)));
        assert_eq!(err.status().http_code(), 500);

        let entries = h.audit.entries();
        assert_eq!(entries.last().unwrap().action, AuditAction::DecryptionFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_calls_are_bounded() {
        let service = KeyLifecycleService::new(
            Arc::new(FakeKeyPairGenerator::new()),
            SymmetricCipher::new(&MasterKey::generate()),
            Arc::new(StalledStore),
            Arc::new(InMemoryAuditLog::new()),
        )
        .with_policy(RotationPolicy {
            operation_timeout: Duration::from_secs(2),
            ..RotationPolicy::default()
        });

        let err = service.get_active_key_labels().await.unwrap_err();
        assert!(matches!(
            err,
            KeyError::Timeout { operation: "get_active_metadata", millis: 2000 }
        ));
        assert_eq!(err.status().http_code(), 500);
    }

    #[tokio::test]
    async fn test_history_is_ordered() {
        let h = harness();
        h.service.rotate(&Actor::new("alice")).await.unwrap();
        h.service.rotate(&Actor::new("bob")).await.unwrap();
        h.service.rotate(&Actor::new("carol")).await.unwrap();

        let history = h.service.key_history().await.unwrap();
        let creators: Vec<_> = history.iter().map(|r| r.created_by.as_str()).collect();
        assert_eq!(creators, ["alice", "bob", "carol"]);
    }
}
