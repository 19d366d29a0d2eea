//! The zero-configuration [`RemoteCatalog`] a node runs with until an
//! operator points it at a real distribution endpoint: permanently
//! unreachable, so a pull cycle logs offline and returns immediately
//! (`spec.md` §8 scenario S6).

use async_trait::async_trait;
use semver::Version;
use tutor_types::{Result, TutorError};
use tutor_vkp::{CatalogEntry, RemoteCatalog, VkpDelta};

pub struct NoopCatalog;

#[async_trait]
impl RemoteCatalog for NoopCatalog {
    async fn is_reachable(&self) -> bool {
        false
    }

    async fn list_entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(Vec::new())
    }

    async fn fetch_delta(&self, _entry: &CatalogEntry, _base_version: &Version) -> Result<Option<VkpDelta>> {
        Err(TutorError::Unavailable("no remote catalog configured".into()))
    }

    async fn fetch_full(&self, _entry: &CatalogEntry) -> Result<Vec<u8>> {
        Err(TutorError::Unavailable("no remote catalog configured".into()))
    }
}
