//! Calls an external managed completion API over HTTP, streaming
//! newline-delimited token chunks (`spec.md` §4.2 step 6, §6).
//!
//! Shares `tutor_embeddings::model::RemoteEmbedding`'s retry/error-
//! classification shape, generalized from one JSON response to a streamed
//! body: a thin HTTP-backed implementation of [`InferenceEngine`].

use crate::{InferenceEngine, Token, TokenStream};
use async_trait::async_trait;
use futures::StreamExt;
use tutor_types::{Result, TutorError};

pub struct RemoteInference {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model_id: String,
    max_retries: u32,
}

impl RemoteInference {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, model_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model_id: model_id.into(),
            max_retries: 4,
        }
    }

    async fn open_stream(&self, prompt: &str, max_tokens: usize) -> std::result::Result<reqwest::Response, TutorError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model_id,
            "prompt": prompt,
            "max_tokens": max_tokens,
            "stream": true,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| classify_reqwest_error(&e))?;
        if resp.status().is_server_error() || resp.status().as_u16() == 429 {
            return Err(TutorError::TransientUpstream(format!(
                "completion API returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(TutorError::PermanentUpstream(format!(
                "completion API returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TutorError {
    if e.is_timeout() || e.is_connect() {
        TutorError::TransientUpstream(e.to_string())
    } else {
        TutorError::PermanentUpstream(e.to_string())
    }
}

#[derive(serde::Deserialize)]
struct CompletionChunk {
    text: String,
    #[serde(default)]
    done: bool,
}

#[async_trait]
impl InferenceEngine for RemoteInference {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<TokenStream> {
        let mut attempt = 0u32;
        let resp = loop {
            match self.open_stream(prompt, max_tokens).await {
                Ok(resp) => break resp,
                Err(TutorError::TransientUpstream(detail)) if attempt < self.max_retries => {
                    let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt));
                    tracing::warn!(attempt, %detail, "retrying transient completion failure");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(TutorError::Generation(e.to_string())),
            }
        };

        let byte_stream = resp.bytes_stream();
        let token_stream = byte_stream.flat_map(|chunk| {
            let lines: Vec<Result<Token>> = match chunk {
                Ok(bytes) => String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| {
                        serde_json::from_str::<CompletionChunk>(line)
                            .map(|c| Token {
                                text: c.text,
                                is_final: c.done,
                            })
                            .map_err(|e| TutorError::Generation(format!("malformed completion chunk: {e}")))
                    })
                    .collect(),
                Err(e) => vec![Err(TutorError::Generation(classify_reqwest_error(&e).to_string()))],
            };
            futures::stream::iter(lines)
        });

        Ok(Box::pin(token_stream))
    }

    async fn health(&self) -> bool {
        matches!(
            self.client
                .get(&self.endpoint)
                .timeout(std::time::Duration::from_secs(3))
                .send()
                .await,
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404
        )
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
