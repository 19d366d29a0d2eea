//! The ten-step query pipeline (`spec.md` §4.2): storage, embedding
//! strategy, inference, cache, and pedagogy components held as `Arc`s on
//! one orchestrator struct, with a post-generation pedagogy/persistence
//! tail spawned once streaming starts.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tutor_cache::{Cache, CacheKey};
use tutor_config::TutorConfig;
use tutor_embeddings::StrategyManager;
use tutor_inference::InferenceEngine;
use tutor_pedagogy::{detect_weak_area, estimate_complexity, update_mastery, PracticeGenerator, TopicClassifier};
use tutor_storage::{CollectionKey, MetadataStore, VectorStore};
use tutor_types::{Grade, Result, SubjectId, TutorError, UserId};

const MAX_QUESTION_LEN: usize = 5000;

/// Below this confidence, a chat answer is not treated as the user having
/// "gotten it right" for mastery purposes. Free-form chat carries no
/// explicit grading signal the way a practice question does, so this is
/// the resolution for that gap (recorded in the project's design notes):
/// a well-grounded, high-confidence answer counts as a correct interaction.
const CORRECT_CONFIDENCE_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub grade: Grade,
    pub question: String,
}

/// What the cache stores under a query's deterministic key: the full
/// response text plus the confidence it was originally produced with, so a
/// cache hit can still drive pedagogy and persistence faithfully
/// (`spec.md` §4.2 step 2 names the response but not the confidence it
/// carries forward; packing both into the cached value resolves that).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAnswer {
    response: String,
    confidence: f32,
}

pub struct RAGPipeline {
    vector_store: Arc<dyn VectorStore>,
    embeddings: Arc<StrategyManager>,
    inference: Arc<dyn InferenceEngine>,
    cache: Arc<dyn Cache>,
    metadata_store: Arc<MetadataStore>,
    classifier: Arc<TopicClassifier>,
    practice: Arc<PracticeGenerator>,
    config: TutorConfig,
}

impl RAGPipeline {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        embeddings: Arc<StrategyManager>,
        inference: Arc<dyn InferenceEngine>,
        cache: Arc<dyn Cache>,
        metadata_store: Arc<MetadataStore>,
        classifier: Arc<TopicClassifier>,
        practice: Arc<PracticeGenerator>,
        config: TutorConfig,
    ) -> Self {
        Self {
            vector_store,
            embeddings,
            inference,
            cache,
            metadata_store,
            classifier,
            practice,
            config,
        }
    }

    /// Runs steps 1–10 of `spec.md` §4.2. Returns a token stream the caller
    /// can forward immediately, plus a `oneshot`-style completion captured
    /// by the background tail. The tail (pedagogy update, chat persistence,
    /// cache store) is driven to completion inside the same spawned task
    /// that forwards tokens, so dropping the returned stream without
    /// draining it also aborts the tail — matching the cancellation
    /// contract in `spec.md` §4.1/§4.2 ("a cancelled request ... does not
    /// write chat/pedagogy").
    ///
    /// # Errors
    /// Returns [`TutorError::Validation`] for empty/over-length input,
    /// [`TutorError::Embedding`]/[`TutorError::Retrieval`]/
    /// [`TutorError::Generation`] for the corresponding upstream failures.
    pub async fn ask(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        validate_question(&request.question)?;

        let installed = self
            .metadata_store
            .get_installed_version(request.subject_id, request.grade)
            .await?;
        let version_str = installed
            .as_ref()
            .map_or_else(|| "unversioned".to_string(), |v| v.version.to_string());

        let cache_key = CacheKey::new(&request.question, request.subject_id, &version_str);

        if let Some(cached_json) = self.cache.get(&cache_key) {
            if let Ok(cached) = serde_json::from_str::<CachedAnswer>(&cached_json) {
                tracing::debug!(subject_id = request.subject_id, "cache hit");
                return Ok(self.stream_and_finish(request, cached.response, cached.confidence, cache_key, version_str));
            }
            tracing::warn!("cache entry failed to deserialize; treating as a miss");
        }

        let question_vector = self
            .embeddings
            .embed(&request.question)
            .await
            .map_err(|e| TutorError::Embedding(e.to_string()))?;

        let collection = CollectionKey::new(request.subject_id, request.grade);
        let retrieved = self
            .vector_store
            .query(&collection, &question_vector, self.config.top_k, self.config.similarity_threshold)
            .await
            .map_err(|e| TutorError::Retrieval(e.to_string()))?;

        let max_similarity = retrieved.iter().map(|c| c.score).fold(0.0_f32, f32::max);
        let confidence =
            (0.6 * max_similarity + 0.4 * (retrieved.len() as f32 / self.config.top_k as f32)).clamp(0.0, 1.0);

        let prompt = assemble_prompt(&request.question, &retrieved, self.config.chunk_size_tokens as usize * 4);

        let token_stream = self
            .inference
            .generate(&prompt, self.config.max_response_tokens as usize)
            .await
            .map_err(|e| TutorError::Generation(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let pipeline = self.clone_for_task();
        let cache_key_for_tail = cache_key;

        tokio::spawn(async move {
            let mut token_stream = token_stream;
            let mut full_response = String::new();
            let mut send_failed = false;

            while let Some(item) = token_stream.next().await {
                match item {
                    Ok(token) => {
                        full_response.push_str(&token.text);
                        if tx.send(Ok(token.text)).await.is_err() {
                            send_failed = true;
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(TutorError::Generation(e.to_string()))).await;
                        send_failed = true;
                        break;
                    }
                }
            }

            if send_failed {
                return;
            }

            pipeline
                .finish(&request, &full_response, confidence, false, &cache_key_for_tail, &version_str)
                .await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    /// Builds the stream for an already-known response (the cache-hit
    /// path): splits it into whitespace tokens so the caller observes the
    /// same incremental-delivery shape as a live generation, then runs the
    /// same pedagogy/persistence tail. `cache_key`/`version_str` are the
    /// ones the hit was resolved under, so the tail never re-stores an
    /// already-cached answer.
    fn stream_and_finish(
        &self,
        request: ChatRequest,
        response: String,
        confidence: f32,
        cache_key: CacheKey,
        version_str: String,
    ) -> BoxStream<'static, Result<String>> {
        let tokens = split_into_tokens(&response);
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let pipeline = self.clone_for_task();

        tokio::spawn(async move {
            for token in tokens {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
            pipeline
                .finish(&request, &response, confidence, true, &cache_key, &version_str)
                .await;
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    /// Step 8–10: pedagogy update, chat persistence, and (for a fresh
    /// generation) the cache store. Failures here are logged and do not
    /// change the terminal result the caller already observed, per
    /// `spec.md` §4.2's "downgrades to a warning kind, not an error".
    async fn finish(
        &self,
        request: &ChatRequest,
        full_response: &str,
        confidence: f32,
        cache_hit: bool,
        cache_key: &CacheKey,
        version_str: &str,
    ) {
        let now = Utc::now();
        let topic = self.classifier.classify(request.subject_id, &request.question);
        let complexity = estimate_complexity(&request.question);
        let correct = confidence >= CORRECT_CONFIDENCE_THRESHOLD;

        let previous = match self.metadata_store.get_topic_mastery(request.user_id, request.subject_id, &topic).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load prior mastery; treating as first interaction");
                None
            }
        };
        let updated = update_mastery(previous.as_ref(), request.user_id, request.subject_id, &topic, complexity, correct, now);

        if let Err(e) = self.metadata_store.upsert_topic_mastery(&updated).await {
            tracing::warn!(error = %e, "failed to persist updated mastery");
        }

        if let Some(weak) = detect_weak_area(&updated, now) {
            if let Err(e) = self.metadata_store.upsert_weak_area(&weak).await {
                tracing::warn!(error = %e, "failed to persist weak-area row");
            }
        } else if let Err(e) = self
            .metadata_store
            .delete_weak_area(request.user_id, request.subject_id, &topic)
            .await
        {
            tracing::warn!(error = %e, "failed to clear a resolved weak-area row");
        }

        if let Err(e) = self
            .metadata_store
            .append_chat_record(request.user_id, request.subject_id, &request.question, full_response, confidence, now)
            .await
        {
            tracing::warn!(error = %e, "failed to append chat record");
        }

        if !cache_hit {
            let cached = CachedAnswer {
                response: full_response.to_string(),
                confidence,
            };
            if let Ok(value) = serde_json::to_string(&cached) {
                self.cache.set(
                    cache_key.clone(),
                    request.subject_id,
                    version_str.to_string(),
                    value,
                    std::time::Duration::from_secs(self.config.cache_ttl_s),
                );
            }
        }

    }

    /// The adaptive practice generator, exposed so the binary's
    /// `practice` operation (`spec.md` §6) can draw on the same mastery
    /// store this pipeline updates.
    #[must_use]
    pub fn practice_generator(&self) -> &Arc<PracticeGenerator> {
        &self.practice
    }

    fn clone_for_task(&self) -> Self {
        Self {
            vector_store: self.vector_store.clone(),
            embeddings: self.embeddings.clone(),
            inference: self.inference.clone(),
            cache: self.cache.clone(),
            metadata_store: self.metadata_store.clone(),
            classifier: self.classifier.clone(),
            practice: self.practice.clone(),
            config: self.config.clone(),
        }
    }
}

fn validate_question(question: &str) -> Result<()> {
    if question.trim().is_empty() {
        return Err(TutorError::Validation("question must not be empty".into()));
    }
    if question.len() > MAX_QUESTION_LEN {
        return Err(TutorError::Validation(format!(
            "question exceeds the {MAX_QUESTION_LEN}-character limit"
        )));
    }
    if question.bytes().filter(|b| *b == 0).count() > 0 {
        return Err(TutorError::Validation("question contains a null byte".into()));
    }
    Ok(())
}

/// Fixed prompt template, greedily packing highest-scoring chunks first
/// until `token_budget_chars` (a character-count proxy for a token budget)
/// is exhausted (`spec.md` §4.2 step 5).
fn assemble_prompt(question: &str, retrieved: &[tutor_storage::RetrievedChunk], token_budget_chars: usize) -> String {
    let mut ranked: Vec<&tutor_storage::RetrievedChunk> = retrieved.iter().collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut context = String::new();
    let mut used = 0usize;
    for chunk in ranked {
        if used + chunk.text.len() > token_budget_chars {
            continue;
        }
        used += chunk.text.len();
        context.push_str("- ");
        context.push_str(&chunk.text);
        context.push('\n');
    }

    if context.is_empty() {
        format!("Jawab pertanyaan berikut semampu yang kamu bisa:\n\nPertanyaan: {question}\nJawaban:")
    } else {
        format!(
            "Gunakan konteks kurikulum berikut untuk menjawab pertanyaan.\n\nKonteks:\n{context}\nPertanyaan: {question}\nJawaban:"
        )
    }
}

fn split_into_tokens(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .iter()
        .enumerate()
        .map(|(i, w)| if i + 1 == words.len() { (*w).to_string() } else { format!("{w} ") })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_over_length_questions() {
        assert!(matches!(validate_question(""), Err(TutorError::Validation(_))));
        assert!(matches!(validate_question("   "), Err(TutorError::Validation(_))));
        let long = "a".repeat(MAX_QUESTION_LEN + 1);
        assert!(matches!(validate_question(&long), Err(TutorError::Validation(_))));
        assert!(validate_question("apa itu fotosintesis?").is_ok());
    }

    #[test]
    fn prompt_assembly_prefers_higher_scoring_chunks_under_budget() {
        let chunks = vec![
            tutor_storage::RetrievedChunk {
                chunk_id: "a".into(),
                text: "x".repeat(50),
                metadata: serde_json::json!({}),
                score: 0.9,
            },
            tutor_storage::RetrievedChunk {
                chunk_id: "b".into(),
                text: "y".repeat(50),
                metadata: serde_json::json!({}),
                score: 0.5,
            },
        ];
        let prompt = assemble_prompt("q", &chunks, 60);
        assert!(prompt.contains(&"x".repeat(50)));
        assert!(!prompt.contains(&"y".repeat(50)));
    }

    #[test]
    fn split_into_tokens_preserves_text_when_rejoined() {
        let tokens = split_into_tokens("halo dunia ini contoh");
        assert_eq!(tokens.concat(), "halo dunia ini contoh");
    }
}
