//! Domain entities from `spec.md` §3, kept deliberately plain-data: no
//! behavior lives on these structs beyond constructors and the invariants
//! that are cheap to assert at construction time. Mutating operations live
//! on the owning store/engine.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable integer identity for a [`User`].
pub type UserId = i64;
/// Stable integer identity for a [`Subject`].
pub type SubjectId = i64;
/// Stable integer identity for a [`Book`].
pub type BookId = i64;
/// Stable integer identity for a [`ChatRecord`].
pub type ChatRecordId = i64;
/// Stable integer identity for a [`PracticeQuestion`].
pub type PracticeQuestionId = i64;

/// A user's role, drawn from a closed set (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// A registered user. The secret is stored only as `password_hash`, never
/// in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub display_name: String,
}

/// A bearer-token session bound to a user with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The three grade levels this curriculum covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    Ten = 10,
    Eleven = 11,
    Twelve = 12,
}

impl Grade {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            10 => Some(Self::Ten),
            11 => Some(Self::Eleven),
            12 => Some(Self::Twelve),
            _ => None,
        }
    }
}

/// A curriculum subject: `(grade, name, code)`, unique by `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub grade: Grade,
    pub name: String,
    pub code: String,
}

/// A book belonging to a [`Subject`], tracking the currently installed VKP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub subject_id: SubjectId,
    pub installed_version: Option<Version>,
    pub chunk_count: usize,
    pub source_filename: String,
}

/// An append-only chat turn. Never leaves the node (`spec.md` §1, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: ChatRecordId,
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub question: String,
    pub response: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Per-(user, subject, topic) mastery tracking.
///
/// Invariant: `0 <= correct_count <= question_count` and
/// `mastery_level` is always in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMastery {
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub topic: String,
    pub mastery_level: f64,
    pub question_count: u32,
    pub correct_count: u32,
    pub average_complexity: f64,
    pub last_interaction: DateTime<Utc>,
}

impl TopicMastery {
    /// Validates the invariants `spec.md` §3 and §8 (property 3) require.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.mastery_level) && self.correct_count <= self.question_count
    }
}

/// A derived, regenerated-not-maintained row flagging a weak topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakArea {
    pub user_id: UserId,
    pub subject_id: SubjectId,
    pub topic: String,
    pub weakness_score: f64,
    pub recommended_practice: String,
}

/// Difficulty bucket for a [`PracticeQuestion`], derived from mastery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Bucketing rule from `spec.md` §4.5: `<0.3` easy, `<0.6` medium, else hard.
    #[must_use]
    pub fn from_mastery(mastery_level: f64) -> Self {
        if mastery_level < 0.3 {
            Self::Easy
        } else if mastery_level < 0.6 {
            Self::Medium
        } else {
            Self::Hard
        }
    }
}

/// A durable, reusable practice item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PracticeQuestion {
    pub id: PracticeQuestionId,
    pub subject_id: SubjectId,
    pub topic: String,
    pub difficulty: Difficulty,
    pub question: String,
    pub answer: String,
}

/// Trend classification for a weekly pedagogy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mastery_invariant_catches_bad_rows() {
        let bad = TopicMastery {
            user_id: 1,
            subject_id: 1,
            topic: "aljabar".into(),
            mastery_level: 1.5,
            question_count: 2,
            correct_count: 5,
            average_complexity: 0.5,
            last_interaction: Utc::now(),
        };
        assert!(!bad.is_valid());
    }

    #[test]
    fn difficulty_buckets_match_spec() {
        assert_eq!(Difficulty::from_mastery(0.0), Difficulty::Easy);
        assert_eq!(Difficulty::from_mastery(0.29), Difficulty::Easy);
        assert_eq!(Difficulty::from_mastery(0.3), Difficulty::Medium);
        assert_eq!(Difficulty::from_mastery(0.59), Difficulty::Medium);
        assert_eq!(Difficulty::from_mastery(0.6), Difficulty::Hard);
        assert_eq!(Difficulty::from_mastery(1.0), Difficulty::Hard);
    }
}
