//! The `EmbeddingService` capability interface (`spec.md` §4.4.1) and its
//! two variants: an HTTP-backed remote model and an in-process local one.

use async_trait::async_trait;
use tutor_types::{Result, TutorError};

/// Health of an embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Unhealthy,
}

/// Pure capability interface from text(s) to vectors (`spec.md` §6
/// "Embedding service boundary").
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embeds a single string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds a batch, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    /// Fixed output dimension of this model.
    fn dimension(&self) -> usize;

    /// Cheap liveness probe.
    async fn health(&self) -> Health;

    /// A stable name, used in VKP metadata's `embedding_model_id`.
    fn model_id(&self) -> &str;
}

/// In-process, network-free embedding model. Deterministic so tests (and
/// offline operation, per `spec.md` §1) are reproducible.
pub struct LocalEmbedding {
    model_id: String,
    dimension: usize,
}

impl LocalEmbedding {
    #[must_use]
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
        }
    }

    /// A 384-dimension local model, the default `D_local` from `spec.md` §4.4.2.
    #[must_use]
    pub fn default_local() -> Self {
        Self::new("local-bge-small-384", 384)
    }
}

#[async_trait]
impl EmbeddingModel for LocalEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(deterministic_embedding(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health(&self) -> Health {
        Health::Ok
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Hashes `text` into a deterministic, L2-normalized vector of `dimension`
/// floats. Not semantically meaningful — a stand-in for a real local model —
/// but stable across calls and processes, which is what retrieval
/// correctness tests need.
fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    use sha2::{Digest, Sha256};
    let mut vector = Vec::with_capacity(dimension);
    let mut counter: u32 = 0;
    while vector.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks(4) {
            if vector.len() >= dimension {
                break;
            }
            let mut buf = [0u8; 4];
            buf[..chunk.len()].copy_from_slice(chunk);
            #[allow(clippy::cast_precision_loss)]
            let v = (u32::from_le_bytes(buf) as f32 / u32::MAX as f32) * 2.0 - 1.0;
            vector.push(v);
        }
        counter += 1;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Calls an external managed embedding API over HTTP, retried with
/// exponential backoff on transient errors (`spec.md` §4.4.2, §6).
pub struct RemoteEmbedding {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model_id: String,
    dimension: usize,
    max_retries: u32,
}

impl RemoteEmbedding {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model_id: model_id.into(),
            dimension,
            max_retries: 4,
        }
    }

    async fn request_once(&self, text: &str) -> std::result::Result<Vec<f32>, TutorError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model_id,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if resp.status().is_server_error() || resp.status().as_u16() == 429 {
            return Err(TutorError::TransientUpstream(format!(
                "embedding API returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(TutorError::PermanentUpstream(format!(
                "embedding API returned {}",
                resp.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingResponse {
            embedding: Vec<f32>,
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| TutorError::PermanentUpstream(format!("malformed embedding response: {e}")))?;
        Ok(parsed.embedding)
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TutorError {
    if e.is_timeout() || e.is_connect() {
        TutorError::TransientUpstream(e.to_string())
    } else {
        TutorError::PermanentUpstream(e.to_string())
    }
}

#[async_trait]
impl EmbeddingModel for RemoteEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0u32;
        loop {
            match self.request_once(text).await {
                Ok(v) => return Ok(v),
                Err(TutorError::TransientUpstream(detail)) if attempt < self.max_retries => {
                    let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt));
                    tracing::warn!(attempt, %detail, "retrying transient embedding failure");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(TutorError::Embedding(e.to_string())),
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health(&self) -> Health {
        match self
            .client
            .get(&self.endpoint)
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => Health::Ok,
            _ => Health::Unhealthy,
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_embedding_is_deterministic_and_normalized() {
        let model = LocalEmbedding::default_local();
        let a = model.embed("Apa teorema Pythagoras?").await.unwrap();
        let b = model.embed("Apa teorema Pythagoras?").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn distinct_text_yields_distinct_vectors() {
        let model = LocalEmbedding::default_local();
        let a = model.embed("segitiga").await.unwrap();
        let b = model.embed("lingkaran").await.unwrap();
        assert_ne!(a, b);
    }
}
