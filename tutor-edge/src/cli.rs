//! Command-line surface over [`crate::EdgeRuntime`]'s ingress operations
//! (`spec.md` §6): a direct-invocation tool rather than a network server,
//! since the ingress operations are themselves transport-agnostic and an
//! offline-first edge device has no mandated HTTP layer.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tutor_types::{Grade, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraceLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<TraceLevel> for tracing::Level {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Off | TraceLevel::Error => Self::ERROR,
            TraceLevel::Warn => Self::WARN,
            TraceLevel::Info => Self::INFO,
            TraceLevel::Debug => Self::DEBUG,
            TraceLevel::Trace => Self::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tutor-edge")]
#[command(version)]
#[command(about = "Offline-first edge AI tutor node")]
pub struct Cli {
    /// Directory holding this node's databases, vector store, backups, and uploads.
    #[arg(long, global = true, env = "TUTOR_DATA_DIR", default_value = "./tutor-data")]
    pub data_dir: PathBuf,

    /// Configuration file (TOML). Environment variables under `TUTOR_` still apply on top.
    #[arg(short = 'c', long, global = true, env = "TUTOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub trace: TraceLevel,

    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register this node's first administrator (one-time setup).
    InitAdmin { username: String, password: String, display_name: String },
    /// Authenticate and print a bearer token.
    Login { username: String, password: String },
    /// Invalidate a session token.
    Logout { token: String },
    /// Ask a question and stream the tutor's answer.
    Chat {
        token: String,
        subject_id: i64,
        #[arg(value_enum)]
        grade: GradeArg,
        question: String,
    },
    /// Print current admission-queue statistics.
    QueueStats,
    /// Print cache hit/miss/entry statistics.
    CacheStats,
    /// Invalidate every cached answer for a subject (admin).
    CacheInvalidate { token: String, subject_id: i64 },
    /// Print a student's topic mastery across every subject.
    Progress { token: String },
    /// Print a student's detected weak areas.
    WeakAreas { token: String },
    /// Generate practice questions for a topic.
    Practice {
        token: String,
        subject_id: i64,
        topic: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Build a weekly progress report over an inclusive date range (RFC 3339 timestamps).
    WeeklyReport {
        token: String,
        subject_id: i64,
        start: String,
        end: String,
    },
    /// Upload a curriculum source file to the node's drop directory (admin).
    UploadCurriculum {
        token: String,
        subject_id: i64,
        #[arg(value_enum)]
        grade: GradeArg,
        path: PathBuf,
    },
    /// Create a subject (admin).
    CreateSubject {
        token: String,
        #[arg(value_enum)]
        grade: GradeArg,
        name: String,
        code: String,
    },
    /// List every subject.
    ListSubjects { token: String },
    /// Rename a subject or change its code (admin).
    UpdateSubject { token: String, subject_id: i64, name: String, code: String },
    /// Delete a subject (admin).
    DeleteSubject { token: String, subject_id: i64 },
    /// List registered users (admin).
    ListUsers { token: String },
    /// Register a new account (admin).
    RegisterUser {
        token: String,
        username: String,
        password: String,
        #[arg(value_enum)]
        role: RoleArg,
        display_name: String,
    },
    /// Reconcile curriculum against the configured remote catalog.
    PullCurriculum,
    /// Run every health probe.
    Health,
    /// Snapshot the node's current state and print the backup id (admin).
    BackupNow { token: String },
    /// List available backups (admin).
    ListBackups { token: String },
    /// Restore the node to a previous backup (admin).
    Rollback { token: String, target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GradeArg {
    Ten,
    Eleven,
    Twelve,
}

impl From<GradeArg> for Grade {
    fn from(g: GradeArg) -> Self {
        match g {
            GradeArg::Ten => Self::Ten,
            GradeArg::Eleven => Self::Eleven,
            GradeArg::Twelve => Self::Twelve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Student,
    Teacher,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Student => Self::Student,
            RoleArg::Teacher => Self::Teacher,
            RoleArg::Admin => Self::Admin,
        }
    }
}
