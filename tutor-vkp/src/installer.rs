//! The single writer for a collection: installs a verified [`Vkp`] into the
//! vector store and metadata database atomically with respect to readers
//! (`spec.md` §4.6.2, §5).

use crate::codec;
use crate::types::Vkp;
use chrono::Utc;
use std::sync::Arc;
use tutor_cache::Cache;
use tutor_storage::{ChunkRecord, CollectionKey, MetadataStore, VectorStore};
use tutor_types::{Result, TutorError};

pub struct VkpInstaller {
    vector_store: Arc<dyn VectorStore>,
    metadata_store: Arc<MetadataStore>,
    cache: Arc<dyn Cache>,
}

impl VkpInstaller {
    #[must_use]
    pub fn new(vector_store: Arc<dyn VectorStore>, metadata_store: Arc<MetadataStore>, cache: Arc<dyn Cache>) -> Self {
        Self {
            vector_store,
            metadata_store,
            cache,
        }
    }

    /// Installs `vkp` for its `(subject, grade)`, replacing the existing
    /// collection's contents, updating the installed-version index, and
    /// invalidating stale cache entries (`spec.md` §4.6.2 steps 1-4).
    ///
    /// # Errors
    /// Returns [`TutorError::ChecksumMismatch`] if `vkp`'s checksum doesn't
    /// verify (the vector store and metadata store are never touched in
    /// that case), or [`TutorError::Storage`] if the underlying writes fail.
    pub async fn install(&self, vkp: &Vkp) -> Result<()> {
        let recomputed = codec::checksum(vkp);
        if recomputed != vkp.checksum {
            return Err(TutorError::ChecksumMismatch {
                expected: vkp.checksum.clone(),
                computed: recomputed,
            });
        }

        let key = CollectionKey::new(vkp.metadata.subject_id, vkp.metadata.grade);
        self.vector_store.create_collection(&key).await?;

        let chunks: Vec<ChunkRecord> = vkp
            .chunks
            .iter()
            .map(|c| ChunkRecord {
                chunk_id: c.chunk_id.clone(),
                text: c.text.clone(),
                embedding: c.embedding.clone(),
                metadata: c.metadata.clone(),
            })
            .collect();
        // Atomic with respect to readers: implementations of `VectorStore`
        // either write into the live collection transactionally or build a
        // new one and swap it in, per `spec.md` §4.6.2's note that either
        // strategy satisfies "readers continue to observe the prior
        // contents until step 2 completes".
        self.vector_store.swap_collection(&key, chunks).await?;

        let source_filename = vkp.metadata.source_files.first().cloned().unwrap_or_default();
        self.metadata_store
            .install_version(
                vkp.metadata.subject_id,
                vkp.metadata.grade,
                &vkp.metadata.version,
                &vkp.checksum,
                vkp.metadata.total_chunks,
                &source_filename,
                Utc::now(),
            )
            .await?;

        self.cache
            .invalidate_subject_version(vkp.metadata.subject_id, &vkp.metadata.version.to_string());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build;
    use crate::types::{VkpChunk, VkpMetadata};
    use semver::Version;
    use tutor_cache::MokaCache;
    use tutor_storage::SledVectorStore;

    fn metadata() -> VkpMetadata {
        VkpMetadata {
            version: Version::parse("1.0.0").unwrap(),
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

    #[tokio::test]
    async fn install_populates_vector_store_and_version_index() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(dir.path().join("vec")).unwrap());
        let metadata_store = Arc::new(
            MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap(),
        );
        metadata_store.create_subject(tutor_types::Grade::Ten, "Matematika", "MTK").await.unwrap();
        let cache: Arc<dyn Cache> = Arc::new(MokaCache::new(100, std::time::Duration::from_secs(60)));

        let vkp = build(
            metadata(),
            vec![VkpChunk {
                chunk_id: "c1".into(),
                text: "teorema pythagoras".into(),
                embedding: vec![0.1, 0.2, 0.3],
                metadata: serde_json::json!({}),
            }],
        )
        .unwrap();

        let installer = VkpInstaller::new(vector_store.clone(), metadata_store.clone(), cache);
        installer.install(&vkp).await.unwrap();

        let key = CollectionKey::new(1, tutor_types::Grade::Ten);
        assert_eq!(vector_store.count(&key).await.unwrap(), 1);

        let installed = metadata_store.get_installed_version(1, tutor_types::Grade::Ten).await.unwrap().unwrap();
        assert_eq!(installed.version.to_string(), "1.0.0");
        assert_eq!(installed.chunk_count, 1);
    }

    #[tokio::test]
    async fn install_rejects_a_tampered_package() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store: Arc<dyn VectorStore> = Arc::new(SledVectorStore::open(dir.path().join("vec")).unwrap());
        let metadata_store = Arc::new(
            MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap(),
        );
        let cache: Arc<dyn Cache> = Arc::new(MokaCache::new(100, std::time::Duration::from_secs(60)));

        let mut vkp = build(
            metadata(),
            vec![VkpChunk {
                chunk_id: "c1".into(),
                text: "teorema pythagoras".into(),
                embedding: vec![0.1, 0.2, 0.3],
                metadata: serde_json::json!({}),
            }],
        )
        .unwrap();
        vkp.checksum = "sha256:0000000000000000000000000000000000000000000000000000000000000".into();

        let installer = VkpInstaller::new(vector_store.clone(), metadata_store, cache);
        let result = installer.install(&vkp).await;
        assert!(matches!(result, Err(TutorError::ChecksumMismatch { .. })));

        let key = CollectionKey::new(1, tutor_types::Grade::Ten);
        assert_eq!(vector_store.count(&key).await.unwrap(), 0);
    }
}
