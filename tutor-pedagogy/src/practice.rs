//! Adaptive practice-question generation (`spec.md` §4.5 "Adaptive question
//! generation"): difficulty bucketed from mastery, drawn from the durable
//! pool, topped up via the [`InferenceEngine`] when the pool is thin.

use futures::StreamExt;
use std::sync::Arc;
use tutor_inference::InferenceEngine;
use tutor_storage::MetadataStore;
use tutor_types::{Difficulty, PracticeQuestion, Result, SubjectId};

pub struct PracticeGenerator {
    metadata_store: Arc<MetadataStore>,
    inference: Arc<dyn InferenceEngine>,
    max_generation_tokens: usize,
}

impl PracticeGenerator {
    #[must_use]
    pub fn new(metadata_store: Arc<MetadataStore>, inference: Arc<dyn InferenceEngine>, max_generation_tokens: usize) -> Self {
        Self {
            metadata_store,
            inference,
            max_generation_tokens,
        }
    }

    /// Returns up to `count` practice questions for `(subject, topic)` at
    /// the difficulty implied by `mastery_level`, generating new ones via
    /// the inference engine when the durable pool doesn't have enough.
    ///
    /// # Errors
    /// Propagates [`tutor_types::TutorError::Storage`] from the pool lookup
    /// or [`tutor_types::TutorError::Generation`] from the inference engine.
    pub async fn next_questions(
        &self,
        subject_id: SubjectId,
        topic: &str,
        mastery_level: f64,
        count: usize,
    ) -> Result<Vec<PracticeQuestion>> {
        let difficulty = Difficulty::from_mastery(mastery_level);
        let mut pool = self
            .metadata_store
            .find_practice_questions(subject_id, topic, difficulty, count)
            .await?;

        let shortfall = count.saturating_sub(pool.len());
        for _ in 0..shortfall {
            let generated = self.generate_one(subject_id, topic, difficulty).await?;
            pool.push(generated);
        }

        Ok(pool)
    }

    async fn generate_one(&self, subject_id: SubjectId, topic: &str, difficulty: Difficulty) -> Result<PracticeQuestion> {
        let prompt = format!(
            "Buatlah satu soal latihan tingkat {difficulty:?} tentang topik \"{topic}\" beserta jawabannya. \
             Format: baris pertama soal, baris kedua jawaban."
        );
        let mut stream = self.inference.generate(&prompt, self.max_generation_tokens).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?.text);
        }

        let mut lines = text.splitn(2, '\n');
        let question = lines.next().unwrap_or_default().trim().to_string();
        let answer = lines.next().unwrap_or_default().trim().to_string();

        let id = self
            .metadata_store
            .insert_practice_question(subject_id, topic, difficulty, &question, &answer)
            .await?;

        Ok(PracticeQuestion {
            id,
            subject_id,
            topic: topic.to_string(),
            difficulty,
            question,
            answer,
        })
    }
}
