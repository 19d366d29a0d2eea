//! The VKP wire/on-disk format and its delta envelope (`spec.md` §3, §4.6).

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tutor_types::{Grade, SubjectId};

/// Metadata describing a package, distinct from its chunk payload so a
/// catalog listing can carry metadata without the (possibly large) chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VkpMetadata {
    pub version: Version,
    pub subject_id: SubjectId,
    pub grade: Grade,
    pub semester: u8,
    pub created_at: DateTime<Utc>,
    pub embedding_model_id: String,
    pub chunk_size_tokens: u32,
    pub chunk_overlap_tokens: u32,
    pub total_chunks: usize,
    pub source_files: Vec<String>,
}

/// One curriculum chunk as it travels inside a VKP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VkpChunk {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// A fully self-describing curriculum package (`spec.md` §3 "VKP").
/// `checksum` is `"sha256:"` followed by lowercase hex, per the wire format
/// in §6, computed over every other field by [`crate::codec::checksum`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vkp {
    pub metadata: VkpMetadata,
    pub chunks: Vec<VkpChunk>,
    pub checksum: String,
}

/// A minimal description of content changes between two VKPs of the same
/// `(subject, grade, semester)` (`spec.md` §4.6.1, §6 "VKP delta wire
/// format").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VkpDelta {
    pub base_version: Version,
    pub target_version: Version,
    pub subject_id: SubjectId,
    pub grade: Grade,
    pub semester: u8,
    pub added_chunks: Vec<VkpChunk>,
    pub removed_chunk_ids: Vec<String>,
    pub target_metadata: VkpMetadata,
    pub checksum: String,
}

/// Ordering result for two semantic versions (`spec.md` §4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Newer,
    Older,
    Equal,
}

/// A single remote catalog entry (`spec.md` §6 "Remote catalog boundary").
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub subject_id: SubjectId,
    pub grade: Grade,
    pub semester: u8,
    pub version: Version,
    pub checksum: String,
    pub object_key: String,
}
