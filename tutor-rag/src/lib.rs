//! Orchestrates the chat query pipeline (`spec.md` §4.2): embedding,
//! retrieval, prompting, streamed generation, pedagogy, and persistence
//! under one read-mostly-VectorStore invariant.

pub mod pipeline;

pub use pipeline::{ChatRequest, RAGPipeline};
