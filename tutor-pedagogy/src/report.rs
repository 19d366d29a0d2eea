//! Weekly progress report with trend classification (`spec.md` §4.5
//! "Weekly report").
//!
//! The spec names "a trend classification {improving, stable, declining}
//! derived from mastery deltas in the window" without pinning how a delta
//! is sampled, since [`tutor_types::TopicMastery`] stores one evolving row
//! per topic rather than a time series. This resolves that (recorded in
//! the project's design notes) by replaying the window's chat history
//! through the same pure [`crate::mastery::update_mastery`] function used
//! live, starting from an empty synthetic state at the first record in the
//! window: the synthetic mastery trajectory's first and last values give a
//! real, reproducible delta confined to `[start, end]`.

use crate::classifier::{estimate_complexity, TopicClassifier};
use crate::mastery::update_mastery;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tutor_storage::MetadataStore;
use tutor_types::{Result, SubjectId, TopicMastery, Trend, UserId, WeakArea};

#[derive(Debug, Clone, serde::Serialize)]
pub struct TopicSummary {
    pub topic: String,
    pub mastery_level: f64,
    pub question_count: u32,
    pub trend: Trend,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WeeklyReport {
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_questions: usize,
    pub topics: Vec<TopicSummary>,
    pub weak_areas: Vec<WeakArea>,
}

pub struct ReportBuilder {
    metadata_store: Arc<MetadataStore>,
    classifier: Arc<TopicClassifier>,
}

impl ReportBuilder {
    #[must_use]
    pub fn new(metadata_store: Arc<MetadataStore>, classifier: Arc<TopicClassifier>) -> Self {
        Self {
            metadata_store,
            classifier,
        }
    }

    /// Builds the report for `(user, subject)` over `[start, end]`.
    ///
    /// # Errors
    /// Propagates [`tutor_types::TutorError::Storage`] from the underlying
    /// reads.
    pub async fn build(&self, user_id: UserId, subject_id: SubjectId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<WeeklyReport> {
        let records = self
            .metadata_store
            .list_chat_records_in_range(user_id, subject_id, start, end)
            .await?;

        let mut by_topic: HashMap<String, Vec<f64>> = HashMap::new();
        for record in &records {
            let topic = self.classifier.classify(subject_id, &record.question);
            let complexity = estimate_complexity(&record.question);
            by_topic.entry(topic).or_default().push(complexity);
        }

        let mut topics = Vec::with_capacity(by_topic.len());
        let mut weak_areas = Vec::new();
        for (topic, complexities) in &by_topic {
            let mut synthetic: Option<TopicMastery> = None;
            let mut trajectory = Vec::with_capacity(complexities.len());
            for (i, complexity) in complexities.iter().enumerate() {
                let now = start + chrono::Duration::seconds(i as i64);
                let updated = update_mastery(synthetic.as_ref(), user_id, subject_id, topic, *complexity, true, now);
                trajectory.push(updated.mastery_level);
                synthetic = Some(updated);
            }

            let trend = classify_trend(&trajectory);

            let live_mastery = self
                .metadata_store
                .get_topic_mastery(user_id, subject_id, topic)
                .await?;
            let mastery_level = live_mastery.as_ref().map_or(0.0, |m| m.mastery_level);

            if let Some(mastery) = &live_mastery {
                if let Some(weak) = crate::mastery::detect_weak_area(mastery, end) {
                    weak_areas.push(weak);
                }
            }

            topics.push(TopicSummary {
                topic: topic.clone(),
                mastery_level,
                question_count: complexities.len() as u32,
                trend,
            });
        }
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));

        Ok(WeeklyReport {
            user_id,
            subject_id,
            start,
            end,
            total_questions: records.len(),
            topics,
            weak_areas,
        })
    }
}

/// Classifies a mastery trajectory's sign. Fewer than two samples is
/// `Stable` — there's nothing to compare.
fn classify_trend(trajectory: &[f64]) -> Trend {
    match (trajectory.first(), trajectory.last()) {
        (Some(first), Some(last)) if trajectory.len() >= 2 => {
            let delta = last - first;
            if delta > 0.02 {
                Trend::Improving
            } else if delta < -0.02 {
                Trend::Declining
            } else {
                Trend::Stable
            }
        }
        _ => Trend::Stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_classification_matches_sign_of_delta() {
        assert_eq!(classify_trend(&[0.2, 0.5]), Trend::Improving);
        assert_eq!(classify_trend(&[0.5, 0.2]), Trend::Declining);
        assert_eq!(classify_trend(&[0.4, 0.41]), Trend::Stable);
        assert_eq!(classify_trend(&[0.4]), Trend::Stable);
        assert_eq!(classify_trend(&[]), Trend::Stable);
    }
}
