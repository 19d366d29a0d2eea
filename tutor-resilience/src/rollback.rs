//! `snapshot()` / `rollback(target)` (`spec.md` §4.7): restores a node to an
//! earlier backup, rolling forward to the pre-rollback state if the restored
//! node fails its health checks. Serialized behind a single lock since the
//! section requires rollback be "safe to invoke concurrently from only one
//! actor".

use crate::backup::BackupManager;
use crate::health::HealthChecker;
use crate::snapshot::{BackupKind, BackupPayload};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tutor_config::TutorConfig;
use tutor_storage::{MetadataStore, VectorStore};
use tutor_types::{Result, TutorError};

/// The services a rollback must quiesce before touching storage and bring
/// back up afterward — an external-collaborator interface, since
/// `tutor-resilience` doesn't own the chat ingress or inference lifecycle
/// itself (`spec.md` §6 wires those in `tutor-edge`).
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn stop(&self);
    async fn start(&self);
}

/// A `ServiceControl` that does nothing, for rollbacks run outside a live
/// node (tests, offline maintenance tooling).
pub struct NoopServiceControl;

#[async_trait]
impl ServiceControl for NoopServiceControl {
    async fn stop(&self) {}
    async fn start(&self) {}
}

pub struct RollbackManager {
    backups: Arc<BackupManager>,
    metadata_store: Arc<MetadataStore>,
    vector_store: Arc<dyn VectorStore>,
    health: Arc<HealthChecker>,
    lock: Mutex<()>,
}

impl RollbackManager {
    #[must_use]
    pub fn new(
        backups: Arc<BackupManager>,
        metadata_store: Arc<MetadataStore>,
        vector_store: Arc<dyn VectorStore>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            backups,
            metadata_store,
            vector_store,
            health,
            lock: Mutex::new(()),
        }
    }

    /// Captures the current state as a full backup and returns its id, a
    /// valid `rollback` target (`spec.md` §4.7 `snapshot()`).
    pub async fn snapshot(&self, tutor_config: &TutorConfig) -> Result<String> {
        let _guard = self.lock.lock().await;
        let meta = self.backups.create_full_backup(tutor_config).await?;
        Ok(meta.id)
    }

    /// Restores the node to `target`'s state. On success the node has been
    /// stopped, restored, restarted, and passed its health checks. On
    /// failure — a restore error or a failed post-restart health check —
    /// the node is rolled forward back to the state it was in when
    /// `rollback` was called, and an error is returned.
    pub async fn rollback(&self, target: &str, tutor_config: &TutorConfig, control: &dyn ServiceControl) -> Result<()> {
        let _guard = self.lock.lock().await;
        let pre_rollback = self.backups.create_full_backup(tutor_config).await?;

        control.stop().await;
        let outcome = self.restore_to(target).await;
        control.start().await;

        let restore_error = match outcome {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        let health_ok = if restore_error.is_none() {
            self.health.check_all().await.is_healthy()
        } else {
            false
        };

        if restore_error.is_none() && health_ok {
            return Ok(());
        }

        tracing::error!(
            target,
            restore_error = restore_error.as_ref().map(ToString::to_string),
            health_ok,
            "rollback failed; rolling forward to the pre-rollback snapshot"
        );

        control.stop().await;
        self.restore_to(&pre_rollback.id).await?;
        control.start().await;

        Err(restore_error.unwrap_or_else(|| {
            TutorError::Unavailable(format!("rollback to {target} failed health checks after restart; rolled forward"))
        }))
    }

    async fn restore_to(&self, id: &str) -> Result<()> {
        let meta = self.backups.metadata_for(id)?;
        match meta.kind {
            BackupKind::Full => self.restore_full(id).await,
            BackupKind::Incremental => {
                let base_id = meta
                    .base_id
                    .clone()
                    .ok_or_else(|| TutorError::Storage(format!("incremental backup {id} has no base_id")))?;
                self.restore_full(&base_id).await?;
                self.apply_incremental(id).await
            }
        }
    }

    async fn restore_full(&self, id: &str) -> Result<()> {
        match self.backups.read_backup(id)? {
            BackupPayload::Full(data) => {
                self.metadata_store.restore_snapshot(data.metadata).await?;
                self.vector_store.import_all(data.vectors).await?;
                Ok(())
            }
            BackupPayload::Incremental(_) => Err(TutorError::Storage(format!("backup {id} is not a full backup"))),
        }
    }

    async fn apply_incremental(&self, id: &str) -> Result<()> {
        match self.backups.read_backup(id)? {
            BackupPayload::Incremental(data) => self.metadata_store.apply_incremental(data).await,
            BackupPayload::Full(_) => Err(TutorError::Storage(format!("backup {id} is not an incremental backup"))),
        }
    }
}
