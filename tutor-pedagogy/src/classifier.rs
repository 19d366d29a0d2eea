//! Deterministic topic classification and complexity estimation
//! (`spec.md` §4.5 "Topic classification").
//!
//! Implemented as a keyword/rule table per subject rather than a learned
//! classifier — a learned classifier would satisfy the same contract as
//! long as it stays pure and deterministic. The rule table itself is small
//! and curriculum-specific;
//! a real deployment would load it per subject from configuration, but the
//! shape — ordered `(topic, keywords)` pairs, first match wins, `"unknown"`
//! sentinel on no match — is what matters for testability.

use std::collections::HashMap;
use tutor_types::SubjectId;

#[derive(Debug, Clone, Copy)]
pub struct TopicRule {
    pub topic: &'static str,
    pub keywords: &'static [&'static str],
}

/// Sentinel returned when no rule matches (`spec.md` §4.5).
pub const UNKNOWN_TOPIC: &str = "unknown";

pub struct TopicClassifier {
    rules: HashMap<SubjectId, Vec<TopicRule>>,
}

impl TopicClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self { rules: HashMap::new() }
    }

    /// Registers the ordered rule table for `subject_id`. Later calls
    /// replace any existing table for that subject.
    pub fn register(&mut self, subject_id: SubjectId, rules: Vec<TopicRule>) {
        self.rules.insert(subject_id, rules);
    }

    /// Classifies `question` against `subject_id`'s rule table, first match
    /// wins, case-insensitive keyword containment.
    #[must_use]
    pub fn classify(&self, subject_id: SubjectId, question: &str) -> String {
        let lowered = question.to_lowercase();
        if let Some(rules) = self.rules.get(&subject_id) {
            for rule in rules {
                if rule.keywords.iter().any(|kw| lowered.contains(kw)) {
                    return rule.topic.to_string();
                }
            }
        }
        UNKNOWN_TOPIC.to_string()
    }
}

impl Default for TopicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic complexity estimate in `[0, 1]` for a question, used both
/// live (to feed [`crate::mastery::update_mastery`]) and retroactively when
/// reconstructing a trend for the weekly report. The spec names "complexity"
/// as a PedagogyEngine output without pinning how it is computed from text;
/// this resolves that by a pure, length/structure-based heuristic: longer
/// and more multi-clause questions ("mengapa", "bagaimana", "buktikan")
/// estimate as more complex than short lookup-style questions.
#[must_use]
pub fn estimate_complexity(question: &str) -> f64 {
    let lowered = question.to_lowercase();
    let word_count = lowered.split_whitespace().count();
    let length_component = (word_count as f64 / 20.0).min(1.0);

    const COMPLEX_MARKERS: &[&str] = &["mengapa", "bagaimana", "buktikan", "jelaskan", "bandingkan"];
    let marker_component = if COMPLEX_MARKERS.iter().any(|m| lowered.contains(m)) {
        0.3
    } else {
        0.0
    };

    (0.5 * length_component + marker_component).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_unknown_sentinel() {
        let classifier = TopicClassifier::new();
        assert_eq!(classifier.classify(1, "apa kabar"), UNKNOWN_TOPIC);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut classifier = TopicClassifier::new();
        classifier.register(
            1,
            vec![
                TopicRule { topic: "trigonometri", keywords: &["sinus", "cosinus", "tangen"] },
                TopicRule { topic: "aljabar", keywords: &["persamaan", "variabel"] },
            ],
        );
        assert_eq!(classifier.classify(1, "Apa itu sinus dan cosinus?"), "trigonometri");
        assert_eq!(classifier.classify(1, "Bagaimana menyelesaikan persamaan linear?"), "aljabar");
        assert_eq!(classifier.classify(1, "siapa presiden pertama"), UNKNOWN_TOPIC);
    }

    #[test]
    fn complexity_is_bounded_and_monotonic_in_length() {
        let short = estimate_complexity("apa itu pi");
        let long = estimate_complexity("mengapa dan bagaimana integral tak tentu dapat dibuktikan secara umum untuk semua fungsi polinomial");
        assert!((0.0..=1.0).contains(&short));
        assert!((0.0..=1.0).contains(&long));
        assert!(long > short);
    }
}
