//! Typed configuration for the edge tutor runtime: a typed struct layered
//! over the `config` crate. A file (TOML) is merged with environment
//! overrides under a fixed prefix, and `#[serde(deny_unknown_fields)]` on
//! the root struct turns an unrecognized key into a load-time error instead
//! of a silently ignored typo.
//!
//! Recognized options and their defaults are exactly the table in
//! `spec.md` §6.

use serde::{Deserialize, Serialize};
use tutor_types::{Result, TutorError};

/// The embedding strategy a node is configured to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStrategyKind {
    Remote,
    Local,
}

/// Root configuration object. Every field has the default named in
/// `spec.md` §6; `#[serde(default = ...)]` wires that default in so a
/// partial config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TutorConfig {
    /// `P`: maximum concurrent inference requests.
    pub max_concurrent: usize,
    /// `Q`: maximum queued requests before `QueueFull`.
    pub max_queue: usize,
    /// Seconds a queued request may wait before being cancelled with `Timeout`.
    pub queue_timeout_s: u64,
    /// Cache entry time-to-live, in seconds.
    pub cache_ttl_s: u64,
    /// In-memory LRU cache capacity (entry count).
    pub lru_cap: u64,
    /// Retrieval fan-out: number of chunks requested per query.
    pub top_k: usize,
    /// Minimum cosine similarity for a retrieved chunk to qualify.
    pub similarity_threshold: f32,
    /// Chunking window size, in tokens, used by the cloud-side packager
    /// (carried here only because `chunk_config` round-trips through VKP
    /// metadata and installed-version bookkeeping).
    pub chunk_size_tokens: u32,
    /// Chunking overlap, in tokens.
    pub chunk_overlap_tokens: u32,
    /// Hard cap on generated tokens per response.
    pub max_response_tokens: u32,
    /// Base `MetadataStore` connection pool size.
    pub pool_size: u32,
    /// Additional burst connections above `pool_size`.
    pub max_overflow: u32,
    /// Seconds a caller waits for a pooled connection before failing.
    pub pool_timeout_s: u64,
    /// Days a backup is retained before pruning.
    pub backup_retention_days: u32,
    /// Default embedding strategy.
    pub embedding_strategy: EmbeddingStrategyKind,
    /// Whether an unhealthy primary embedding strategy may fall back.
    pub fallback_enabled: bool,
    /// Forbids ever selecting the remote embedding strategy.
    pub sovereign_mode: bool,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue: 1000,
            queue_timeout_s: 300,
            cache_ttl_s: 86_400,
            lru_cap: 1000,
            top_k: 5,
            similarity_threshold: 0.7,
            chunk_size_tokens: 800,
            chunk_overlap_tokens: 100,
            max_response_tokens: 512,
            pool_size: 10,
            max_overflow: 20,
            pool_timeout_s: 30,
            backup_retention_days: 28,
            embedding_strategy: EmbeddingStrategyKind::Remote,
            fallback_enabled: true,
            sovereign_mode: false,
        }
    }
}

impl TutorConfig {
    /// Loads configuration by layering, in order: built-in defaults, an
    /// optional TOML file at `path`, then environment variables prefixed
    /// `TUTOR_` (e.g. `TUTOR_MAX_CONCURRENT=8`). Unknown keys in the file
    /// fail the load rather than being silently dropped.
    ///
    /// # Errors
    /// Returns [`TutorError::Validation`] if the merged configuration does
    /// not deserialize into [`TutorConfig`], or [`TutorError::Internal`] if
    /// a layer cannot be read.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(|e| {
                TutorError::Internal(format!("failed to seed config defaults: {e}"))
            })?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TUTOR")
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .map_err(|e| TutorError::Internal(format!("failed to build config: {e}")))?;

        merged
            .try_deserialize::<Self>()
            .map_err(|e| TutorError::Validation(format!("invalid configuration: {e}")))
    }

    /// Validates cross-field invariants that a plain `Deserialize` cannot
    /// express (e.g. overlap must be smaller than the chunk window).
    ///
    /// # Errors
    /// Returns [`TutorError::Validation`] on the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(TutorError::Validation(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.similarity_threshold < 0.0 || self.similarity_threshold > 1.0 {
            return Err(TutorError::Validation(
                "similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.chunk_overlap_tokens >= self.chunk_size_tokens {
            return Err(TutorError::Validation(
                "chunk_overlap_tokens must be smaller than chunk_size_tokens".into(),
            ));
        }
        if self.sovereign_mode && self.embedding_strategy == EmbeddingStrategyKind::Remote {
            return Err(TutorError::Validation(
                "sovereign_mode forbids a remote default embedding_strategy".into(),
            ));
        }
        Ok(())
    }
}
