//! Shared domain types, identifiers, and error kinds for the edge tutor
//! runtime. Every other crate in the workspace depends on this one and
//! nothing else depends on them, keeping the dependency graph a DAG rooted
//! here.

pub mod domain;
pub mod error;

pub use domain::{
    Book, BookId, ChatRecord, ChatRecordId, Difficulty, Grade, PracticeQuestion,
    PracticeQuestionId, Role, Session, Subject, SubjectId, TopicMastery, Trend, User, UserId,
    WeakArea,
};
pub use error::{Result, TutorError};
