//! Package format, checksum integrity, version comparison, delta
//! computation/application, and atomic installation for curriculum content
//! (`spec.md` §3, §4.6).

pub mod codec;
pub mod installer;
pub mod puller;
pub mod types;

pub use codec::{apply_delta, build, checksum, compare_versions, delta, parse, serialize, should_pull};
pub use installer::VkpInstaller;
pub use puller::{RemoteCatalog, VkpPuller};
pub use types::{CatalogEntry, Vkp, VkpChunk, VkpDelta, VkpMetadata, VersionOrder};
