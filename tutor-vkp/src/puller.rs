//! Periodic reconciliation against a remote VKP catalog (`spec.md` §4.6.3).

use crate::codec::{self, should_pull};
use crate::installer::VkpInstaller;
use crate::types::{CatalogEntry, Vkp, VkpDelta};
use async_trait::async_trait;
use semver::Version;
use std::sync::Arc;
use tutor_storage::MetadataStore;
use tutor_types::Result;

/// The remote side of the VKP distribution boundary (`spec.md` §6 "Remote
/// catalog boundary"). No assumption about the transport is made beyond
/// these three calls; offline mode is simply `is_reachable` returning
/// `false`.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Cheap connectivity probe; `false` means "stay fully offline this
    /// cycle" (`spec.md` §4.6.3 step 1).
    async fn is_reachable(&self) -> bool;

    /// Every known `(subject, grade, semester)` entry and its latest
    /// published version.
    async fn list_entries(&self) -> Result<Vec<CatalogEntry>>;

    /// A delta from `base_version` to `entry`'s version, if the catalog has
    /// one precomputed.
    async fn fetch_delta(&self, entry: &CatalogEntry, base_version: &Version) -> Result<Option<VkpDelta>>;

    /// The full package bytes for `entry`.
    async fn fetch_full(&self, entry: &CatalogEntry) -> Result<Vec<u8>>;
}

pub struct VkpPuller {
    catalog: Arc<dyn RemoteCatalog>,
    installer: Arc<VkpInstaller>,
    metadata_store: Arc<MetadataStore>,
    /// The caller supplies the previously-installed full `Vkp` for a
    /// `(subject, grade)`, since delta application needs the base package's
    /// chunks, not just its version — a cache or a read path over the
    /// vector store, not specified further here.
    base_lookup: Arc<dyn Fn(&CatalogEntry) -> Option<Vkp> + Send + Sync>,
}

impl VkpPuller {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn RemoteCatalog>,
        installer: Arc<VkpInstaller>,
        metadata_store: Arc<MetadataStore>,
        base_lookup: Arc<dyn Fn(&CatalogEntry) -> Option<Vkp> + Send + Sync>,
    ) -> Self {
        Self {
            catalog,
            installer,
            metadata_store,
            base_lookup,
        }
    }

    /// Runs one reconciliation pass (`spec.md` §4.6.3). A single entry's
    /// failure is logged and does not block the others.
    pub async fn run_once(&self) {
        if !self.catalog.is_reachable().await {
            tracing::info!("no external connectivity; skipping this pull cycle");
            return;
        }

        let entries = match self.catalog.list_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list remote VKP catalog");
                return;
            }
        };

        for entry in entries {
            if let Err(e) = self.reconcile_entry(&entry).await {
                tracing::warn!(
                    subject_id = entry.subject_id,
                    grade = entry.grade.as_u8(),
                    error = %e,
                    "VKP pull failed for this entry; continuing with the rest"
                );
            }
        }
    }

    async fn reconcile_entry(&self, entry: &CatalogEntry) -> Result<()> {
        let installed = self
            .metadata_store
            .get_installed_version(entry.subject_id, entry.grade)
            .await?;
        let installed_version = installed.as_ref().map(|v| &v.version);

        if !should_pull(installed_version, entry) {
            return Ok(());
        }

        let candidate = self.resolve_package(entry, installed_version).await?;

        if codec::checksum(&candidate) != entry.checksum {
            return Err(tutor_types::TutorError::ChecksumMismatch {
                expected: entry.checksum.clone(),
                computed: codec::checksum(&candidate),
            });
        }

        self.installer.install(&candidate).await
    }

    async fn resolve_package(&self, entry: &CatalogEntry, installed_version: Option<&Version>) -> Result<Vkp> {
        if let Some(base_version) = installed_version {
            if let Some(delta) = self.catalog.fetch_delta(entry, base_version).await? {
                if let Some(base) = (self.base_lookup)(entry) {
                    let applied = codec::apply_delta(&base, &delta)?;
                    if codec::checksum(&applied) == entry.checksum {
                        return Ok(applied);
                    }
                    tracing::warn!(
                        subject_id = entry.subject_id,
                        "delta application checksum mismatch; falling back to full download"
                    );
                }
            }
        }
        let bytes = self.catalog.fetch_full(entry).await?;
        codec::parse(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build;
    use crate::types::{VkpChunk, VkpMetadata};
    use chrono::Utc;
    use std::sync::Mutex;
    use tutor_cache::{Cache, MokaCache};
    use tutor_storage::{SledVectorStore, VectorStore};

    fn metadata(version: &str) -> VkpMetadata {
        VkpMetadata {
            version: Version::parse(version).unwrap(),
            subject_id: 1,
            grade: tutor_types::Grade::Ten,
            semester: 1,
            created_at: Utc::now(),
            embedding_model_id: "local-bge-small-384".into(),
            chunk_size_tokens: 800,
            chunk_overlap_tokens: 100,
            total_chunks: 0,
            source_files: vec!["matematika.pdf".into()],
        }
    }

    struct StubCatalog {
        reachable: bool,
        entries: Vec<CatalogEntry>,
        full_bytes: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl RemoteCatalog for StubCatalog {
        async fn is_reachable(&self) -> bool {
            self.reachable
        }
        async fn list_entries(&self) -> Result<Vec<CatalogEntry>> {
            Ok(self.entries.clone())
        }
        async fn fetch_delta(&self, _entry: &CatalogEntry, _base_version: &Version) -> Result<Option<VkpDelta>> {
            Ok(None)
        }
        async fn fetch_full(&self, _entry: &CatalogEntry) -> Result<Vec<u8>> {
            Ok(self.full_bytes.lock().unwrap().clone().unwrap())
        }
    }

    #[tokio::test]
    async fn offline_pass_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(dir.path().join("vec")).unwrap());
        let metadata_store = Arc::new(
            MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap(),
        );
        let cache: Arc<dyn Cache> = Arc::new(MokaCache::new(100, std::time::Duration::from_secs(60)));
        let installer = Arc::new(VkpInstaller::new(vector_store, metadata_store.clone(), cache));
        let catalog = Arc::new(StubCatalog {
            reachable: false,
            entries: vec![],
            full_bytes: Mutex::new(None),
        });
        let puller = VkpPuller::new(catalog, installer, metadata_store, Arc::new(|_| None));
        puller.run_once().await;
    }

    #[tokio::test]
    async fn pulls_a_strictly_newer_entry_via_full_download() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(dir.path().join("vec")).unwrap());
        let metadata_store = Arc::new(
            MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap(),
        );
        metadata_store.create_subject(tutor_types::Grade::Ten, "Matematika", "MTK").await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(MokaCache::new(100, std::time::Duration::from_secs(60)));
        let installer = Arc::new(VkpInstaller::new(vector_store.clone(), metadata_store.clone(), cache));

        let vkp = build(
            metadata("1.0.0"),
            vec![VkpChunk {
                chunk_id: "c1".into(),
                text: "teorema".into(),
                embedding: vec![0.1, 0.2],
                metadata: serde_json::json!({}),
            }],
        )
        .unwrap();
        let bytes = codec::serialize(&vkp).unwrap();

        let entry = CatalogEntry {
            subject_id: 1,
            grade: tutor_types::Grade::Ten,
            semester: 1,
            version: Version::parse("1.0.0").unwrap(),
            checksum: vkp.checksum.clone(),
            object_key: "matematika/kelas_10/v1.0.0.vkp".into(),
        };
        let catalog = Arc::new(StubCatalog {
            reachable: true,
            entries: vec![entry],
            full_bytes: Mutex::new(Some(bytes)),
        });

        let puller = VkpPuller::new(catalog, installer, metadata_store.clone(), Arc::new(|_| None));
        puller.run_once().await;

        let installed = metadata_store.get_installed_version(1, tutor_types::Grade::Ten).await.unwrap().unwrap();
        assert_eq!(installed.version.to_string(), "1.0.0");
    }
}
