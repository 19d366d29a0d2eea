//! Produces fixed-dimension vectors from text (`spec.md` §4.4).

pub mod model;
pub mod strategy;

pub use model::{EmbeddingModel, Health, LocalEmbedding, RemoteEmbedding};
pub use strategy::StrategyManager;
