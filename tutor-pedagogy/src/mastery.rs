//! Mastery update and weak-area detection (`spec.md` §4.5).

use chrono::{DateTime, Utc};
use tutor_types::{SubjectId, TopicMastery, UserId, WeakArea};

/// Pure mastery update: given the previous row (or `None` for a topic seen
/// for the first time) and this interaction's complexity, returns the
/// updated row. `now` is the interaction timestamp.
///
/// Coefficients and their direction are pinned exactly as `spec.md` §4.5
/// specifies: `mastery = clamp(0.3*frequency + 0.5*complexity + 0.2*retention, 0, 1)`,
/// `frequency = 1/(1 + 0.1*q)`, `complexity = min(c, 1)`, `retention = min(r/30, 1)`.
#[must_use]
pub fn update_mastery(
    previous: Option<&TopicMastery>,
    user_id: UserId,
    subject_id: SubjectId,
    topic: &str,
    interaction_complexity: f64,
    correct: bool,
    now: DateTime<Utc>,
) -> TopicMastery {
    let (question_count, correct_count, average_complexity, last_interaction) = match previous {
        Some(prev) => (prev.question_count, prev.correct_count, prev.average_complexity, prev.last_interaction),
        None => (0, 0, 0.0, now),
    };

    let new_question_count = question_count + 1;
    let new_correct_count = correct_count + u32::from(correct);
    let new_average_complexity =
        (average_complexity * f64::from(question_count) + interaction_complexity) / f64::from(new_question_count);

    let days_since_last = (now - last_interaction).num_seconds().max(0) as f64 / 86400.0;

    let q = f64::from(new_question_count);
    let frequency = 1.0 / (1.0 + 0.1 * q);
    let complexity = new_average_complexity.min(1.0);
    let retention = (days_since_last / 30.0).min(1.0);

    let mastery_level = (0.3 * frequency + 0.5 * complexity + 0.2 * retention).clamp(0.0, 1.0);

    TopicMastery {
        user_id,
        subject_id,
        topic: topic.to_string(),
        mastery_level,
        question_count: new_question_count,
        correct_count: new_correct_count,
        average_complexity: new_average_complexity,
        last_interaction: now,
    }
}

/// Flags a topic as weak per `spec.md` §4.5's three-way OR rule, returning
/// the [`WeakArea`] row to upsert, or `None` if none of the conditions hold.
#[must_use]
pub fn detect_weak_area(mastery: &TopicMastery, now: DateTime<Utc>) -> Option<WeakArea> {
    let days_since_last = (now - mastery.last_interaction).num_seconds().max(0) as f64 / 86400.0;
    let q = mastery.question_count;
    let c = mastery.average_complexity;

    let is_weak = mastery.mastery_level < 0.4
        || (q > 5 && days_since_last < 3.0)
        || (c < 0.5 && q > 3);

    if !is_weak {
        return None;
    }

    let weakness_score = 1.0 - mastery.mastery_level;
    let recommended_practice = if c < 0.5 {
        format!("Latih soal {} dengan variasi kompleksitas lebih tinggi", mastery.topic)
    } else {
        format!("Ulangi latihan {} secara berkala untuk menjaga retensi", mastery.topic)
    };

    Some(WeakArea {
        user_id: mastery.user_id,
        subject_id: mastery.subject_id,
        topic: mastery.topic.clone(),
        weakness_score,
        recommended_practice,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mastery_stays_within_bounds_for_any_inputs() {
        let now = Utc::now();
        let row = update_mastery(None, 1, 1, "aljabar", 0.9, true, now);
        assert!(row.is_valid());
    }

    #[test]
    fn higher_complexity_increases_mastery_holding_else_equal() {
        let now = Utc::now();
        let low = update_mastery(None, 1, 1, "aljabar", 0.1, true, now);
        let high = update_mastery(None, 1, 1, "aljabar", 0.9, true, now);
        assert!(high.mastery_level > low.mastery_level);
    }

    #[test]
    fn frequent_uncomplicated_asking_lowers_mastery() {
        let now = Utc::now();
        let mut row = update_mastery(None, 1, 1, "aljabar", 0.1, true, now);
        for _ in 0..10 {
            row = update_mastery(Some(&row), 1, 1, "aljabar", 0.1, true, now);
        }
        let single = update_mastery(None, 1, 1, "aljabar", 0.1, true, now);
        assert!(row.mastery_level <= single.mastery_level);
    }

    #[test]
    fn low_mastery_is_flagged_weak() {
        let now = Utc::now();
        let mastery = TopicMastery {
            user_id: 1,
            subject_id: 1,
            topic: "aljabar".into(),
            mastery_level: 0.2,
            question_count: 2,
            correct_count: 1,
            average_complexity: 0.2,
            last_interaction: now,
        };
        assert!(detect_weak_area(&mastery, now).is_some());
    }

    #[test]
    fn high_mastery_with_few_questions_is_not_flagged() {
        let now = Utc::now();
        let mastery = TopicMastery {
            user_id: 1,
            subject_id: 1,
            topic: "aljabar".into(),
            mastery_level: 0.8,
            question_count: 2,
            correct_count: 2,
            average_complexity: 0.9,
            last_interaction: now,
        };
        assert!(detect_weak_area(&mastery, now).is_none());
    }
}
