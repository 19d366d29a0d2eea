//! In-process, network-free generation backend for `sovereign_mode` and the
//! local half of the embedding-style fallback policy (`spec.md` §1
//! "continue to operate fully when disconnected").
//!
//! Real local inference needs a GGUF or similar model file on disk that
//! this workspace cannot carry. In its place, [`LocalInference`] is a
//! deterministic stand-in in the same spirit as
//! `tutor_embeddings::LocalEmbedding`: it produces a stable, reproducible
//! token stream from any prompt, so the concurrency core, streaming
//! contract, and cancellation paths above it can be built and tested without
//! a real model present.

use crate::{InferenceEngine, Token, TokenStream};
use async_trait::async_trait;
use futures::stream;
use tutor_types::Result;

pub struct LocalInference {
    model_id: String,
}

impl LocalInference {
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
        }
    }

    #[must_use]
    pub fn default_local() -> Self {
        Self::new("local-tutor-7b-gguf")
    }
}

#[async_trait]
impl InferenceEngine for LocalInference {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<TokenStream> {
        let words: Vec<String> = deterministic_response(prompt)
            .split_whitespace()
            .map(str::to_string)
            .take(max_tokens.max(1))
            .collect();
        let total = words.len();
        let items: Vec<Result<Token>> = words
            .into_iter()
            .enumerate()
            .map(|(i, w)| {
                Ok(Token {
                    text: if i + 1 == total { w } else { format!("{w} ") },
                    is_final: i + 1 == total,
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn health(&self) -> bool {
        true
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Builds a deterministic, stable reply from `prompt` so tests can assert
/// exact output without a real model. Not semantically meaningful.
fn deterministic_response(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return "Maaf, saya tidak menerima pertanyaan.".to_string();
    }
    format!(
        "Berdasarkan materi yang tersedia, berikut penjelasannya mengenai: {trimmed}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn generate_is_deterministic() {
        let engine = LocalInference::default_local();
        let mut a = engine.generate("teorema Pythagoras", 50).await.unwrap();
        let mut b = engine.generate("teorema Pythagoras", 50).await.unwrap();
        let mut out_a = String::new();
        let mut out_b = String::new();
        while let Some(tok) = a.next().await {
            out_a.push_str(&tok.unwrap().text);
        }
        while let Some(tok) = b.next().await {
            out_b.push_str(&tok.unwrap().text);
        }
        assert_eq!(out_a, out_b);
    }

    #[tokio::test]
    async fn respects_max_tokens_cap() {
        let engine = LocalInference::default_local();
        let mut stream = engine.generate("apa itu integral tak tentu dalam kalkulus", 3).await.unwrap();
        let mut count = 0;
        let mut last_final = false;
        while let Some(tok) = stream.next().await {
            let tok = tok.unwrap();
            count += 1;
            last_final = tok.is_final;
        }
        assert_eq!(count, 3);
        assert!(last_final, "the final emitted token must be marked final");
    }
}
