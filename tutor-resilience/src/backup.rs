//! Scheduling, persisting, and pruning backups (`spec.md` §4.7): a config,
//! a backup directory holding one bundle file plus one sidecar file per
//! backup, and a retention sweep run after every creation.

use crate::snapshot::{self, BackupKind, BackupMetadata, BackupPayload, FullBackupData};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tutor_config::TutorConfig;
use tutor_storage::{IncrementalSnapshot, MetadataStore, VectorStore};
use tutor_types::{Result, TutorError};
use uuid::Uuid;

/// Where backups land and how they're protected.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    /// `None` disables encryption for new backups; existing encrypted
    /// backups still need the same key to restore.
    pub encryption_key: Option<[u8; 32]>,
    /// Mirrors `spec.md` §4.7's 28-day window (`TutorConfig::backup_retention_days`).
    pub retention_days: u32,
}

impl BackupConfig {
    #[must_use]
    pub fn new(backup_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            encryption_key: None,
            retention_days,
        }
    }

    #[must_use]
    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }
}

/// Creates, lists, restores, and prunes backups for one tutor node.
///
/// Owns no lock of its own: callers that also need rollback safety should
/// serialize through [`crate::rollback::RollbackManager`], which wraps a
/// `BackupManager` behind a single-actor mutex.
pub struct BackupManager {
    config: BackupConfig,
    metadata_store: Arc<MetadataStore>,
    vector_store: Arc<dyn VectorStore>,
}

impl BackupManager {
    /// # Errors
    /// Returns [`TutorError::Storage`] if `backup_dir` cannot be created.
    pub fn new(config: BackupConfig, metadata_store: Arc<MetadataStore>, vector_store: Arc<dyn VectorStore>) -> Result<Self> {
        std::fs::create_dir_all(&config.backup_dir)
            .map_err(|e| TutorError::Storage(format!("failed to create backup directory: {e}")))?;
        Ok(Self {
            config,
            metadata_store,
            vector_store,
        })
    }

    /// Captures a weekly full backup: every metadata table, every vector
    /// collection, and the configuration in force (`spec.md` §4.7).
    pub async fn create_full_backup(&self, tutor_config: &TutorConfig) -> Result<BackupMetadata> {
        let metadata = self.metadata_store.export_snapshot().await?;
        let vectors = self.vector_store.export_all().await?;
        let payload = BackupPayload::Full(FullBackupData {
            metadata,
            vectors,
            config: tutor_config.clone(),
        });
        let written = self.write_backup(BackupKind::Full, None, &payload)?;
        self.prune_expired()?;
        Ok(written)
    }

    /// Captures a daily incremental backup: chat turns and installed-version
    /// changes since `base`'s creation time (`spec.md` §4.7).
    pub async fn create_incremental_backup(&self, base: &BackupMetadata) -> Result<BackupMetadata> {
        let chat_records = self.metadata_store.list_all_chat_records_since(base.created_at).await?;
        let installed_versions = self
            .metadata_store
            .list_all_installed_versions()
            .await?
            .into_iter()
            .filter(|v| v.installed_at >= base.created_at)
            .collect();
        let payload = BackupPayload::Incremental(IncrementalSnapshot {
            chat_records,
            installed_versions,
        });
        let written = self.write_backup(BackupKind::Incremental, Some(base.id.clone()), &payload)?;
        self.prune_expired()?;
        Ok(written)
    }

    fn write_backup(&self, kind: BackupKind, base_id: Option<String>, payload: &BackupPayload) -> Result<BackupMetadata> {
        let bytes = snapshot::seal(payload, self.config.encryption_key.as_ref())?;
        let id = Uuid::new_v4().to_string();
        let meta = BackupMetadata {
            id: id.clone(),
            kind,
            created_at: Utc::now(),
            base_id,
            size_bytes: bytes.len() as u64,
            integrity_hash: snapshot::integrity_hash(&bytes),
            encrypted: self.config.encryption_key.is_some(),
        };
        std::fs::write(self.bundle_path(&id), &bytes)
            .map_err(|e| TutorError::Storage(format!("failed to write backup bundle: {e}")))?;
        let sidecar = serde_json::to_vec_pretty(&meta)
            .map_err(|e| TutorError::Storage(format!("failed to serialize backup sidecar: {e}")))?;
        std::fs::write(self.sidecar_path(&id), sidecar)
            .map_err(|e| TutorError::Storage(format!("failed to write backup sidecar: {e}")))?;
        Ok(meta)
    }

    /// The sidecar for a single backup, by id.
    pub fn metadata_for(&self, id: &str) -> Result<BackupMetadata> {
        self.read_sidecar(id)
    }

    /// Reads and verifies a backup's payload off disk without restoring it.
    pub fn read_backup(&self, id: &str) -> Result<BackupPayload> {
        let meta = self.read_sidecar(id)?;
        let bytes = std::fs::read(self.bundle_path(id))
            .map_err(|e| TutorError::Storage(format!("failed to read backup bundle {id}: {e}")))?;
        if snapshot::integrity_hash(&bytes) != meta.integrity_hash {
            return Err(TutorError::ChecksumMismatch {
                expected: meta.integrity_hash,
                computed: snapshot::integrity_hash(&bytes),
            });
        }
        snapshot::unseal(&bytes, self.config.encryption_key.as_ref())
    }

    /// Every backup's sidecar, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let mut metas = Vec::new();
        let entries = std::fs::read_dir(&self.config.backup_dir)
            .map_err(|e| TutorError::Storage(format!("failed to list backup directory: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| TutorError::Storage(format!("failed to read backup directory entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let bytes = std::fs::read(&path)
                    .map_err(|e| TutorError::Storage(format!("failed to read sidecar {}: {e}", path.display())))?;
                let meta: BackupMetadata = serde_json::from_slice(&bytes)
                    .map_err(|e| TutorError::Storage(format!("failed to parse sidecar {}: {e}", path.display())))?;
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// The most recent full backup, used as an incremental's base and as a
    /// rollback target's starting point.
    pub fn latest_full_backup(&self) -> Result<Option<BackupMetadata>> {
        Ok(self.list_backups()?.into_iter().find(|b| b.kind == BackupKind::Full))
    }

    /// Deletes every backup older than `retention_days` (`spec.md` §4.7 /
    /// §8 property 15). A full backup is only pruned once no surviving
    /// incremental still depends on it as its base.
    pub fn prune_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let backups = self.list_backups()?;
        let kept_bases: std::collections::HashSet<String> = backups
            .iter()
            .filter(|b| b.created_at >= cutoff)
            .filter_map(|b| b.base_id.clone())
            .collect();

        let mut pruned = 0;
        for backup in &backups {
            let still_needed = backup.created_at >= cutoff || kept_bases.contains(&backup.id);
            if !still_needed {
                self.delete_backup(&backup.id)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn delete_backup(&self, id: &str) -> Result<()> {
        let _ = std::fs::remove_file(self.bundle_path(id));
        let _ = std::fs::remove_file(self.sidecar_path(id));
        Ok(())
    }

    fn read_sidecar(&self, id: &str) -> Result<BackupMetadata> {
        let bytes = std::fs::read(self.sidecar_path(id))
            .map_err(|e| TutorError::Storage(format!("unknown backup {id}: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| TutorError::Storage(format!("corrupt sidecar for backup {id}: {e}")))
    }

    fn bundle_path(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{id}.bin"))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(format!("{id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_storage::SledVectorStore;

    async fn harness() -> (BackupManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(dir.path().join("vec")).unwrap());
        let metadata_store = Arc::new(
            MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap(),
        );
        let config = BackupConfig::new(dir.path().join("backups"), 28);
        let manager = BackupManager::new(config, metadata_store, vector_store).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn full_backup_round_trips_through_read_backup() {
        let (manager, _dir) = harness().await;
        manager
            .metadata_store
            .create_subject(tutor_types::Grade::Ten, "Matematika", "MTK")
            .await
            .unwrap();

        let meta = manager.create_full_backup(&TutorConfig::default()).await.unwrap();
        assert_eq!(meta.kind, BackupKind::Full);
        assert!(meta.base_id.is_none());

        let payload = manager.read_backup(&meta.id).unwrap();
        match payload {
            BackupPayload::Full(data) => assert_eq!(data.metadata.subjects.len(), 1),
            BackupPayload::Incremental(_) => panic!("expected a full backup payload"),
        }
    }

    #[tokio::test]
    async fn incremental_backup_carries_only_deltas_since_its_base() {
        let (manager, _dir) = harness().await;
        let base = manager.create_full_backup(&TutorConfig::default()).await.unwrap();

        let subject_id = manager
            .metadata_store
            .create_subject(tutor_types::Grade::Ten, "Matematika", "MTK")
            .await
            .unwrap();
        let user_id = manager
            .metadata_store
            .create_user("budi", "hash", tutor_types::Role::Student, "Budi")
            .await
            .unwrap();
        manager
            .metadata_store
            .append_chat_record(user_id, subject_id, "q", "a", 0.9, Utc::now())
            .await
            .unwrap();

        let incr = manager.create_incremental_backup(&base).await.unwrap();
        assert_eq!(incr.kind, BackupKind::Incremental);
        assert_eq!(incr.base_id.as_deref(), Some(base.id.as_str()));

        match manager.read_backup(&incr.id).unwrap() {
            BackupPayload::Incremental(data) => assert_eq!(data.chat_records.len(), 1),
            BackupPayload::Full(_) => panic!("expected an incremental payload"),
        }
    }

    #[tokio::test]
    async fn list_backups_is_sorted_newest_first() {
        let (manager, _dir) = harness().await;
        let first = manager.create_full_backup(&TutorConfig::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = manager.create_full_backup(&TutorConfig::default()).await.unwrap();

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn prune_expired_deletes_backups_past_retention_but_keeps_bases_in_use() {
        let (manager, _dir) = harness().await;
        let base = manager.create_full_backup(&TutorConfig::default()).await.unwrap();

        // Force the base to look 40 days old, past a 28-day retention window.
        let mut aged = base.clone();
        aged.created_at = Utc::now() - chrono::Duration::days(40);
        let sidecar = serde_json::to_vec_pretty(&aged).unwrap();
        std::fs::write(manager.sidecar_path(&aged.id), sidecar).unwrap();

        // A fresh incremental still depends on it as its base.
        manager.create_incremental_backup(&aged).await.unwrap();

        let pruned = manager.prune_expired().unwrap();
        assert_eq!(pruned, 0, "base is still referenced by a live incremental");
        assert!(manager.list_backups().unwrap().iter().any(|b| b.id == aged.id));
    }
}
