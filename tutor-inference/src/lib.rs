//! Loads an LLM and produces a lazy token sequence from a prompt
//! (`spec.md` §2 "InferenceEngine", §4.2 step 6).
//!
//! [`RemoteInference`] and [`LocalInference`] both implement the same
//! capability split (`complete`/`complete_streaming`-style) behind one
//! trait, generalized from a chat-completion API to the tutor's
//! single-prompt generation contract.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tutor_types::Result;

/// One generated token (or token fragment) plus whether it is the last one
/// the model intends to emit, i.e. a natural stop rather than a cap cutoff.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub is_final: bool,
}

/// A lazily-produced sequence of [`Token`]s. Consumers drive it; backpressure
/// on the stream propagates to generation (`spec.md` §4.1 "token emission
/// does not hold a permit beyond generation completion").
pub type TokenStream = BoxStream<'static, Result<Token>>;

/// Capability interface from a prompt to a streamed completion
/// (`spec.md` §2, §6 "Embedding/inference service boundary").
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Streams tokens for `prompt`, stopping at `max_tokens` if the model has
    /// not already produced a natural stop.
    ///
    /// # Errors
    /// Returns [`tutor_types::TutorError::Generation`] if the backend cannot
    /// start generating at all (a mid-stream failure is instead surfaced as
    /// an `Err` item within the returned stream, per `spec.md` §4.2 edge
    /// case "InferenceEngine error mid-stream").
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<TokenStream>;

    /// Cheap liveness probe, used by the resilience layer's health checks
    /// (`spec.md` §4.7).
    async fn health(&self) -> bool;

    /// A stable identifier for logs and VKP-adjacent metadata.
    fn model_id(&self) -> &str;
}

pub use local::LocalInference;
pub use remote::RemoteInference;
