//! Durable storage for the edge tutor: a vector index over curriculum
//! chunks and a relational store over everything else (`spec.md` §3).
//!
//! The two stores have disjoint ownership by design (`spec.md` §3
//! "Ownership and lifecycle"): [`vector_store::VectorStore`] exclusively
//! owns chunk vectors; [`metadata_store::MetadataStore`] exclusively owns
//! identities, sessions, chats, pedagogy rows, and installed-version
//! records.

pub mod metadata_store;
pub mod vector_store;

pub use metadata_store::{IncrementalSnapshot, InstalledVersion, MetadataSnapshot, MetadataStore};
pub use vector_store::{ChunkRecord, CollectionKey, RetrievedChunk, SledVectorStore, VectorStore};
