//! [`EdgeRuntime`]: wires every subsystem together and exposes the ingress
//! operations of an edge tutor node (`spec.md` §6).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use tutor_auth::AuthService;
use tutor_cache::{Cache, CacheStats};
use tutor_concurrency::{ConcurrencyCore, ConcurrencyStats, Handle, Job};
use tutor_config::TutorConfig;
use tutor_embeddings::{EmbeddingModel, LocalEmbedding, RemoteEmbedding, StrategyManager};
use tutor_inference::{InferenceEngine, LocalInference, RemoteInference};
use tutor_pedagogy::{PracticeGenerator, ReportBuilder, TopicClassifier, WeeklyReport};
use tutor_resilience::{
    BackupConfig, BackupManager, BackupMetadata, HealthChecker, HealthReport, LoggingNotificationHook, NoopServiceControl,
    RollbackManager, ServiceControl, Supervisor,
};
use tutor_storage::{MetadataStore, SledVectorStore, VectorStore};
use tutor_types::{
    Book, Grade, PracticeQuestion, Result, Role, Session, Subject, SubjectId, TopicMastery, TutorError, User, UserId,
    WeakArea,
};
use tutor_vkp::{CatalogEntry, RemoteCatalog, Vkp, VkpInstaller, VkpPuller};

use crate::catalog::NoopCatalog;
use crate::topics;

/// A session's fixed lifetime. Not a config knob in `spec.md` §6's table;
/// kept as an internal policy constant instead.
fn session_ttl() -> ChronoDuration {
    ChronoDuration::hours(24)
}

/// Every subsystem a node needs, constructed once at startup and shared
/// behind `Arc`s for the lifetime of the process.
pub struct EdgeRuntime {
    data_dir: PathBuf,
    config: TutorConfig,
    metadata_store: Arc<MetadataStore>,
    vector_store: Arc<dyn VectorStore>,
    cache: Arc<dyn Cache>,
    inference: Arc<dyn InferenceEngine>,
    classifier: Arc<TopicClassifier>,
    practice: Arc<PracticeGenerator>,
    report_builder: Arc<ReportBuilder>,
    rag: Arc<tutor_rag::RAGPipeline>,
    concurrency: Arc<ConcurrencyCore>,
    auth: Arc<AuthService>,
    vkp_installer: Arc<VkpInstaller>,
    vkp_puller: Arc<VkpPuller>,
    backups: Arc<BackupManager>,
    rollback: Arc<RollbackManager>,
    health: Arc<HealthChecker>,
    supervisor: Arc<Supervisor>,
}

impl EdgeRuntime {
    /// Opens every on-disk store under `data_dir` and wires the
    /// subsystems together. `data_dir` is created if absent.
    ///
    /// # Errors
    /// Propagates any subsystem's open/migration error.
    pub async fn bootstrap(data_dir: impl Into<PathBuf>, config: TutorConfig) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| TutorError::Storage(format!("create data_dir: {e}")))?;
        std::fs::create_dir_all(data_dir.join("uploads")).map_err(|e| TutorError::Storage(format!("create uploads dir: {e}")))?;

        let metadata_store = Arc::new(MetadataStore::open(
            data_dir.join("metadata.sqlite3"),
            config.pool_size,
            config.max_overflow,
            StdDuration::from_secs(config.pool_timeout_s),
        )?);

        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(data_dir.join("vectors"))?);

        let cache: Arc<dyn Cache> =
            Arc::new(tutor_cache::MokaCache::new(config.lru_cap, StdDuration::from_secs(config.cache_ttl_s)));

        let local_embedding: Arc<dyn EmbeddingModel> = Arc::new(LocalEmbedding::default_local());
        let remote_embedding: Option<Arc<dyn EmbeddingModel>> = if config.sovereign_mode {
            None
        } else {
            std::env::var("TUTOR_EMBEDDING_REMOTE_ENDPOINT").ok().map(|endpoint| {
                let api_key = std::env::var("TUTOR_EMBEDDING_REMOTE_API_KEY").ok();
                Arc::new(RemoteEmbedding::new(endpoint, api_key, "remote-embedding", local_embedding.dimension()))
                    as Arc<dyn EmbeddingModel>
            })
        };
        let embeddings = Arc::new(StrategyManager::new(
            remote_embedding,
            local_embedding,
            config.embedding_strategy,
            config.fallback_enabled,
            config.sovereign_mode,
        ));

        let inference: Arc<dyn InferenceEngine> = if !config.sovereign_mode {
            if let Ok(endpoint) = std::env::var("TUTOR_INFERENCE_REMOTE_ENDPOINT") {
                let api_key = std::env::var("TUTOR_INFERENCE_REMOTE_API_KEY").ok();
                Arc::new(RemoteInference::new(endpoint, api_key, "remote-inference"))
            } else {
                Arc::new(LocalInference::default_local())
            }
        } else {
            Arc::new(LocalInference::default_local())
        };

        let mut classifier = TopicClassifier::new();
        for subject in metadata_store.list_subjects().await? {
            if let Some(rule_set) = topics::SUBJECT_RULE_SETS.iter().find(|s| s.code == subject.code) {
                classifier.register(subject.id, rule_set.rules.to_vec());
            }
        }
        let classifier = Arc::new(classifier);

        let practice = Arc::new(PracticeGenerator::new(
            metadata_store.clone(),
            inference.clone(),
            config.max_response_tokens as usize,
        ));
        let report_builder = Arc::new(ReportBuilder::new(metadata_store.clone(), classifier.clone()));

        let rag = Arc::new(tutor_rag::RAGPipeline::new(
            vector_store.clone(),
            embeddings,
            inference.clone(),
            cache.clone(),
            metadata_store.clone(),
            classifier.clone(),
            practice.clone(),
            config.clone(),
        ));

        let concurrency = Arc::new(ConcurrencyCore::new(
            config.max_concurrent,
            config.max_queue,
            StdDuration::from_secs(config.queue_timeout_s),
        ));

        let auth = Arc::new(AuthService::new(metadata_store.clone(), session_ttl()));

        let vkp_installer = Arc::new(VkpInstaller::new(vector_store.clone(), metadata_store.clone(), cache.clone()));

        let remote_catalog: Arc<dyn RemoteCatalog> = Arc::new(NoopCatalog);
        let base_lookup: Arc<dyn Fn(&CatalogEntry) -> Option<Vkp> + Send + Sync> = Arc::new(|_: &CatalogEntry| None);
        let vkp_puller = Arc::new(VkpPuller::new(
            remote_catalog,
            vkp_installer.clone(),
            metadata_store.clone(),
            base_lookup,
        ));

        let mut backup_config = BackupConfig::new(data_dir.join("backups"), config.backup_retention_days);
        if let Ok(passphrase) = std::env::var("TUTOR_BACKUP_PASSPHRASE") {
            backup_config = backup_config.with_encryption_key(tutor_resilience::snapshot::derive_key(passphrase.as_bytes()));
        }
        let backups = Arc::new(BackupManager::new(backup_config, metadata_store.clone(), vector_store.clone())?);

        let health = Arc::new(HealthChecker::new(
            inference.clone(),
            vector_store.clone(),
            metadata_store.clone(),
            data_dir.clone(),
        ));
        let rollback = Arc::new(RollbackManager::new(
            backups.clone(),
            metadata_store.clone(),
            vector_store.clone(),
            health.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(Arc::new(LoggingNotificationHook)));

        Ok(Self {
            data_dir,
            config,
            metadata_store,
            vector_store,
            cache,
            inference,
            classifier,
            practice,
            report_builder,
            rag,
            concurrency,
            auth,
            vkp_installer,
            vkp_puller,
            backups,
            rollback,
            health,
            supervisor,
        })
    }

    /// Runs one VKP reconciliation pass against the node's remote catalog.
    pub async fn pull_curriculum_updates(&self) {
        self.vkp_puller.run_once().await;
    }

    /// Runs every health probe and, for a critical probe, asks the
    /// supervisor whether a restart is warranted (`spec.md` §4.8).
    pub async fn check_health(&self) -> HealthReport {
        let report = self.health.check_all().await;
        for probe in &report.probes {
            let name = probe.name;
            let status = probe.status;
            self.supervisor
                .observe(name, status, || async move {
                    tracing::warn!(probe = %name, "restart action requested by supervisor policy");
                })
                .await;
        }
        report
    }

    // ---- authentication ----

    /// # Errors
    /// Propagates [`AuthService::login`]'s error.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        self.auth.login(username, password, Utc::now()).await
    }

    /// # Errors
    /// Propagates a storage error.
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.auth.logout(token).await
    }

    async fn authenticated(&self, token: &str) -> Result<User> {
        self.auth.authenticate(token, Utc::now()).await
    }

    // ---- chat / retrieval-augmented generation ----

    /// Authenticates `token`, then admits a chat request onto the bounded
    /// concurrency core. The returned handle exposes queue position,
    /// streamed tokens, and cancellation (`spec.md` §6 `chat()`).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve, or
    /// [`TutorError::QueueFull`] if the queue is saturated.
    pub async fn chat(&self, token: &str, subject_id: SubjectId, grade: Grade, question: String) -> Result<Handle<String>> {
        let user = self.authenticated(token).await?;
        let request = tutor_rag::ChatRequest {
            user_id: user.id,
            subject_id,
            grade,
            question,
        };
        let rag = self.rag.clone();
        let job: Job<String> = Box::new(move |_cancel_token| {
            let once = stream::once(async move { rag.ask(request).await });
            once.flat_map(|result| -> futures::stream::BoxStream<'static, Result<String>> {
                match result {
                    Ok(tokens) => tokens,
                    Err(e) => Box::pin(stream::once(async move { Err(e) })),
                }
            })
            .boxed()
        });
        self.concurrency.submit(job)
    }

    #[must_use]
    pub fn queue_stats(&self) -> ConcurrencyStats {
        self.concurrency.stats()
    }

    // ---- cache administration ----

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Invalidates every cached answer for `subject_id` (admin operation,
    /// `spec.md` §6 `cache_invalidate`).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn cache_invalidate(&self, token: &str, subject_id: SubjectId) -> Result<()> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.cache.invalidate_subject(subject_id);
        Ok(())
    }

    // ---- pedagogy ----

    /// Aggregates a student's topic mastery across every subject they've
    /// interacted with (`spec.md` §6 `progress()`).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve.
    pub async fn progress(&self, token: &str) -> Result<Vec<TopicMastery>> {
        let user = self.authenticated(token).await?;
        let mut out = Vec::new();
        for subject in self.metadata_store.list_subjects().await? {
            out.extend(self.metadata_store.list_topic_mastery(user.id, subject.id).await?);
        }
        Ok(out)
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve.
    pub async fn weak_areas(&self, token: &str) -> Result<Vec<WeakArea>> {
        let user = self.authenticated(token).await?;
        let mut out = Vec::new();
        for subject in self.metadata_store.list_subjects().await? {
            out.extend(self.metadata_store.list_weak_areas(user.id, subject.id).await?);
        }
        Ok(out)
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve, or
    /// propagates a practice-generation error.
    pub async fn practice(
        &self,
        token: &str,
        subject_id: SubjectId,
        topic: &str,
        count: usize,
    ) -> Result<Vec<PracticeQuestion>> {
        let user = self.authenticated(token).await?;
        let mastery = self
            .metadata_store
            .get_topic_mastery(user.id, subject_id, topic)
            .await?
            .map_or(0.0, |m| m.mastery_level);
        self.practice.next_questions(subject_id, topic, mastery, count).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve.
    pub async fn weekly_report(
        &self,
        token: &str,
        subject_id: SubjectId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<WeeklyReport> {
        let user = self.authenticated(token).await?;
        self.report_builder.build(user.id, subject_id, start, end).await
    }

    // ---- curriculum administration ----

    /// Hands the uploaded bytes off to the external VKP producer by
    /// writing them to this node's uploads drop directory, and
    /// acknowledges receipt. Parsing and installation of the resulting
    /// VKP happen out of band, via [`Self::pull_curriculum_updates`]
    /// once the producer has published it (`spec.md` §6 `upload_curriculum`).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin,
    /// or [`TutorError::Storage`] if the bytes can't be written.
    pub async fn upload_curriculum(
        &self,
        token: &str,
        subject_id: SubjectId,
        grade: Grade,
        filename: &str,
        file_bytes: Vec<u8>,
    ) -> Result<UploadAck> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;

        let dir = self.data_dir.join("uploads").join(subject_id.to_string()).join(grade.as_u8().to_string());
        let dir_clone = dir.clone();
        let path = dir.join(filename);
        let size = file_bytes.len();
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir_clone).map_err(|e| TutorError::Storage(format!("create upload dir: {e}")))?;
            std::fs::write(&path, &file_bytes).map_err(|e| TutorError::Storage(format!("write upload: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))??;

        Ok(UploadAck {
            received: true,
            filename,
            size,
        })
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn create_subject(&self, token: &str, grade: Grade, name: &str, code: &str) -> Result<SubjectId> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.metadata_store.create_subject(grade, name, code).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve.
    pub async fn list_subjects(&self, token: &str) -> Result<Vec<Subject>> {
        self.authenticated(token).await?;
        self.metadata_store.list_subjects().await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn update_subject(&self, token: &str, subject_id: SubjectId, name: &str, code: &str) -> Result<()> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.metadata_store.update_subject(subject_id, name, code).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn delete_subject(&self, token: &str, subject_id: SubjectId) -> Result<()> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.metadata_store.delete_subject(subject_id).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve.
    pub async fn get_book(&self, token: &str, subject_id: SubjectId) -> Result<Option<Book>> {
        self.authenticated(token).await?;
        self.metadata_store.get_book_for_subject(subject_id).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn update_book(&self, token: &str, subject_id: SubjectId, source_filename: &str) -> Result<()> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.metadata_store.update_book_filename(subject_id, source_filename).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn list_users(&self, token: &str) -> Result<Vec<User>> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.metadata_store.list_users().await
    }

    /// Provisions a new account (admin operation; not separately named in
    /// `spec.md` §6's ingress list, but required for `list users` to ever
    /// return anything — the external interface surface implies a creation
    /// path exists).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn register_user(&self, token: &str, username: &str, password: &str, role: Role, display_name: &str) -> Result<UserId> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.auth.register_user(username, password, role, display_name).await
    }

    /// Registers the node's first administrator without requiring a prior
    /// session. Intended for a one-time `init` step run by whoever already
    /// has filesystem access to `data_dir` — the same trust boundary a
    /// `sqlite3` shell against the raw database would cross anyway.
    ///
    /// # Errors
    /// Returns [`TutorError::Validation`] if the node already has at least
    /// one user, or propagates a storage error.
    pub async fn bootstrap_admin(&self, username: &str, password: &str, display_name: &str) -> Result<UserId> {
        if !self.metadata_store.list_users().await?.is_empty() {
            return Err(TutorError::Validation("node already has at least one registered user".into()));
        }
        self.auth.register_user(username, password, Role::Admin, display_name).await
    }

    // ---- resilience ----

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn backup_now(&self, token: &str) -> Result<String> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.rollback.snapshot(&self.config).await
    }

    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin.
    pub async fn list_backups(&self, token: &str) -> Result<Vec<BackupMetadata>> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.backups.list_backups()
    }

    /// Restores the node to a previous backup. Uses a no-op service
    /// control since a single-process CLI node has no separate service
    /// boundary to stop and restart.
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if `token` doesn't resolve to an admin,
    /// or propagates [`RollbackManager::rollback`]'s error.
    pub async fn rollback(&self, token: &str, target: &str) -> Result<()> {
        let user = self.authenticated(token).await?;
        AuthService::require_role(&user, Role::Admin)?;
        self.rollback.rollback(target, &self.config, &NoopServiceControl as &dyn ServiceControl).await
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Acknowledgement returned to the caller of [`EdgeRuntime::upload_curriculum`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadAck {
    pub received: bool,
    pub filename: String,
    pub size: usize,
}
