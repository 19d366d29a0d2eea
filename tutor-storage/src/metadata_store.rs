//! Durable relational store: users, sessions, chat history, subjects/books,
//! topic mastery, weak areas, practice questions, installed VKP versions
//! (`spec.md` §3). Backed by `sqlite` through a pooled `r2d2` manager.
//!
//! Every write that must be atomic with another (installing a VKP updates
//! both a book row and an installed-version record, per `spec.md` §5) goes
//! through a single `rusqlite` transaction so a crash mid-update can never
//! leave the two out of sync.

use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tutor_types::{
    Book, BookId, ChatRecord, ChatRecordId, Difficulty, Grade, PracticeQuestion,
    PracticeQuestionId, Role, Session, Subject, SubjectId, TopicMastery, TutorError, User, UserId,
    WeakArea,
};

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// The currently installed VKP version for a `(subject, grade)` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub subject_id: SubjectId,
    pub grade: Grade,
    pub version: Version,
    pub checksum: String,
    pub chunk_count: usize,
    pub installed_at: DateTime<Utc>,
}

/// A complete point-in-time copy of every table [`MetadataStore`] owns
/// (barring sessions), used by the resilience layer's full backups and by
/// rollback restores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub users: Vec<User>,
    pub subjects: Vec<Subject>,
    pub books: Vec<Book>,
    pub chat_records: Vec<ChatRecord>,
    pub topic_mastery: Vec<TopicMastery>,
    pub weak_areas: Vec<WeakArea>,
    pub practice_questions: Vec<PracticeQuestion>,
    pub installed_versions: Vec<InstalledVersion>,
}

/// The append-only slice of a [`MetadataSnapshot`] an incremental backup
/// carries: new chat turns and installed-version rows changed since the
/// last base (`spec.md` §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementalSnapshot {
    pub chat_records: Vec<ChatRecord>,
    pub installed_versions: Vec<InstalledVersion>,
}

/// Durable relational store, pooled per `spec.md` §5's `pool_size`/
/// `max_overflow`/`pool_timeout_s` knobs.
pub struct MetadataStore {
    pool: Pool,
}

impl MetadataStore {
    /// Opens (creating if absent) the metadata database at `path` and runs
    /// idempotent schema migrations.
    ///
    /// `pool_size` becomes the pool's steady-state connection count;
    /// `max_overflow` is added on top as burst capacity (`r2d2`'s
    /// `max_size`), and `pool_timeout` bounds how long a caller waits for a
    /// connection before failing.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] if the pool cannot be built or the
    /// schema cannot be created.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        pool_size: u32,
        max_overflow: u32,
        pool_timeout: Duration,
    ) -> tutor_types::Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = r2d2::Pool::builder()
            .max_size(pool_size + max_overflow)
            .min_idle(Some(pool_size.min(1)))
            .connection_timeout(pool_timeout)
            .build(manager)
            .map_err(|e| TutorError::Storage(format!("build sqlite pool: {e}")))?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> tutor_types::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| TutorError::Storage(format!("acquire pooled connection: {e}")))
    }

    fn migrate(&self) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                username        TEXT NOT NULL UNIQUE,
                password_hash   TEXT NOT NULL,
                role            TEXT NOT NULL,
                display_name    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token           TEXT PRIMARY KEY,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                created_at      TEXT NOT NULL,
                expires_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);

            CREATE TABLE IF NOT EXISTS subjects (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                grade           INTEGER NOT NULL,
                name            TEXT NOT NULL,
                code            TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS books (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id          INTEGER NOT NULL REFERENCES subjects(id),
                installed_version   TEXT,
                chunk_count         INTEGER NOT NULL DEFAULT 0,
                source_filename     TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS chat_records (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                subject_id      INTEGER NOT NULL REFERENCES subjects(id),
                question        TEXT NOT NULL,
                response        TEXT NOT NULL,
                confidence      REAL NOT NULL,
                timestamp       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_user_subject ON chat_records(user_id, subject_id, timestamp);

            CREATE TABLE IF NOT EXISTS topic_mastery (
                user_id             INTEGER NOT NULL REFERENCES users(id),
                subject_id          INTEGER NOT NULL REFERENCES subjects(id),
                topic               TEXT NOT NULL,
                mastery_level       REAL NOT NULL,
                question_count      INTEGER NOT NULL,
                correct_count       INTEGER NOT NULL,
                average_complexity  REAL NOT NULL,
                last_interaction    TEXT NOT NULL,
                PRIMARY KEY (user_id, subject_id, topic)
            );

            CREATE TABLE IF NOT EXISTS weak_areas (
                user_id                 INTEGER NOT NULL REFERENCES users(id),
                subject_id              INTEGER NOT NULL REFERENCES subjects(id),
                topic                   TEXT NOT NULL,
                weakness_score          REAL NOT NULL,
                recommended_practice    TEXT NOT NULL,
                PRIMARY KEY (user_id, subject_id, topic)
            );

            CREATE TABLE IF NOT EXISTS practice_questions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id      INTEGER NOT NULL REFERENCES subjects(id),
                topic           TEXT NOT NULL,
                difficulty      TEXT NOT NULL,
                question        TEXT NOT NULL,
                answer          TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_practice_lookup ON practice_questions(subject_id, topic, difficulty);

            CREATE TABLE IF NOT EXISTS installed_versions (
                subject_id      INTEGER NOT NULL REFERENCES subjects(id),
                grade           INTEGER NOT NULL,
                version         TEXT NOT NULL,
                checksum        TEXT NOT NULL,
                chunk_count     INTEGER NOT NULL,
                installed_at    TEXT NOT NULL,
                PRIMARY KEY (subject_id, grade)
            );
            ",
        )
        .map_err(|e| TutorError::Storage(format!("run schema migration: {e}")))?;
        Ok(())
    }

    /// Verifies the pool can still hand out a working connection
    /// (`spec.md` §4.7 health checks).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] if a connection cannot be acquired
    /// or a trivial query fails.
    pub async fn health_check(&self) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.execute_batch("SELECT 1;")
                .map_err(|e| TutorError::Storage(format!("health_check: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    // ---- Users & sessions ------------------------------------------------

    /// Creates a user with an already-hashed password.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a duplicate username or DB error.
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
        display_name: &str,
    ) -> tutor_types::Result<UserId> {
        let conn = self.conn()?;
        let (username, password_hash, display_name) = (
            username.to_string(),
            password_hash.to_string(),
            display_name.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO users (username, password_hash, role, display_name) VALUES (?1, ?2, ?3, ?4)",
                params![username, password_hash, role.to_string(), display_name],
            )
            .map_err(|e| TutorError::Storage(format!("create_user: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Looks up a user by username.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_user_by_username(&self, username: &str) -> tutor_types::Result<Option<User>> {
        let conn = self.conn()?;
        let username = username.to_string();
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT id, username, password_hash, role, display_name FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_user_by_username: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every registered user (admin operation, `spec.md` §6).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_users(&self) -> tutor_types::Result<Vec<User>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare("SELECT id, username, password_hash, role, display_name FROM users")
                .map_err(|e| TutorError::Storage(format!("list_users: {e}")))?;
            let rows = stmt
                .query_map([], row_to_user)
                .map_err(|e| TutorError::Storage(format!("list_users: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_users: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Creates a session binding `token` to `user_id` until `expires_at`.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn create_session(
        &self,
        token: &str,
        user_id: UserId,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![token, user_id, created_at.to_rfc3339(), expires_at.to_rfc3339()],
            )
            .map_err(|e| TutorError::Storage(format!("create_session: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Looks up a non-deleted session by token, regardless of expiry (the
    /// caller decides the expiry policy via [`tutor_types::Session::is_expired`]).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_session(&self, token: &str) -> tutor_types::Result<Option<Session>> {
        let conn = self.conn()?;
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = ?1",
                params![token],
                row_to_session,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_session: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Deletes a single session (`logout`).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn delete_session(&self, token: &str) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
                .map_err(|e| TutorError::Storage(format!("delete_session: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Sweeps and returns the count of sessions whose `expires_at` has
    /// passed `now` (`spec.md` §3: "expired sessions are swept periodically").
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> tutor_types::Result<usize> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now.to_rfc3339()])
                .map_err(|e| TutorError::Storage(format!("sweep_expired_sessions: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    // ---- Subjects & books --------------------------------------------------

    /// Creates a subject. Admin-only in the ingress contract (`spec.md` §6).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a duplicate code or DB error.
    pub async fn create_subject(&self, grade: Grade, name: &str, code: &str) -> tutor_types::Result<SubjectId> {
        let conn = self.conn()?;
        let (name, code) = (name.to_string(), code.to_string());
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO subjects (grade, name, code) VALUES (?1, ?2, ?3)",
                params![i64::from(grade.as_u8()), name, code],
            )
            .map_err(|e| TutorError::Storage(format!("create_subject: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every subject in the catalog.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_subjects(&self) -> tutor_types::Result<Vec<Subject>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare("SELECT id, grade, name, code FROM subjects")
                .map_err(|e| TutorError::Storage(format!("list_subjects: {e}")))?;
            let rows = stmt
                .query_map([], row_to_subject)
                .map_err(|e| TutorError::Storage(format!("list_subjects: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_subjects: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Fetches a single subject by id.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_subject(&self, subject_id: SubjectId) -> tutor_types::Result<Option<Subject>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT id, grade, name, code FROM subjects WHERE id = ?1",
                params![subject_id],
                row_to_subject,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_subject: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Deletes a subject (admin operation). Cascades are not automatic;
    /// callers should only do this for subjects with no installed books.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn delete_subject(&self, subject_id: SubjectId) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.execute("DELETE FROM subjects WHERE id = ?1", params![subject_id])
                .map_err(|e| TutorError::Storage(format!("delete_subject: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Renames a subject or changes its catalog code (admin operation,
    /// `spec.md` §6 "update ... subjects"). Grade is immutable once set:
    /// a subject that needs to move grades is deleted and recreated so its
    /// installed VKPs and chat history aren't silently reattributed.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a duplicate code or DB error.
    pub async fn update_subject(&self, subject_id: SubjectId, name: &str, code: &str) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let (name, code) = (name.to_string(), code.to_string());
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "UPDATE subjects SET name = ?2, code = ?3 WHERE id = ?1",
                params![subject_id, name, code],
            )
            .map_err(|e| TutorError::Storage(format!("update_subject: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Edits a book's source filename (admin operation, `spec.md` §6
    /// "update ... books"). The installed version and chunk count are
    /// owned by [`Self::install_version`], not this call.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn update_book_filename(&self, subject_id: SubjectId, source_filename: &str) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let source_filename = source_filename.to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "UPDATE books SET source_filename = ?2 WHERE subject_id = ?1",
                params![subject_id, source_filename],
            )
            .map_err(|e| TutorError::Storage(format!("update_book_filename: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Fetches the book row for a subject, if any has been installed yet.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_book_for_subject(&self, subject_id: SubjectId) -> tutor_types::Result<Option<Book>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT id, subject_id, installed_version, chunk_count, source_filename FROM books WHERE subject_id = ?1",
                params![subject_id],
                row_to_book,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_book_for_subject: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Atomically updates a subject's book row and its installed-version
    /// record in one transaction (`spec.md` §5: "installing a VKP updates
    /// its book row and its version record within one transaction").
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error; the transaction rolls
    /// back on any failure, leaving both rows unchanged.
    pub async fn install_version(
        &self,
        subject_id: SubjectId,
        grade: Grade,
        version: &Version,
        checksum: &str,
        chunk_count: usize,
        source_filename: &str,
        installed_at: DateTime<Utc>,
    ) -> tutor_types::Result<()> {
        let mut conn = self.conn()?;
        let (version_s, checksum, source_filename) =
            (version.to_string(), checksum.to_string(), source_filename.to_string());
        tokio::task::spawn_blocking(move || {
            let tx = conn
                .transaction()
                .map_err(|e| TutorError::Storage(format!("begin tx: {e}")))?;

            let book_exists: bool = tx
                .query_row(
                    "SELECT 1 FROM books WHERE subject_id = ?1",
                    params![subject_id],
                    |_| Ok(true),
                )
                .optional()
                .map_err(|e| TutorError::Storage(format!("install_version: {e}")))?
                .unwrap_or(false);

            if book_exists {
                tx.execute(
                    "UPDATE books SET installed_version = ?2, chunk_count = ?3, source_filename = ?4 WHERE subject_id = ?1",
                    params![subject_id, version_s, chunk_count as i64, source_filename],
                )
            } else {
                tx.execute(
                    "INSERT INTO books (subject_id, installed_version, chunk_count, source_filename) VALUES (?1, ?2, ?3, ?4)",
                    params![subject_id, version_s, chunk_count as i64, source_filename],
                )
            }
            .map_err(|e| TutorError::Storage(format!("install_version (book): {e}")))?;

            tx.execute(
                "INSERT INTO installed_versions (subject_id, grade, version, checksum, chunk_count, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(subject_id, grade) DO UPDATE SET
                    version = excluded.version,
                    checksum = excluded.checksum,
                    chunk_count = excluded.chunk_count,
                    installed_at = excluded.installed_at",
                params![
                    subject_id,
                    i64::from(grade.as_u8()),
                    version_s,
                    checksum,
                    chunk_count as i64,
                    installed_at.to_rfc3339()
                ],
            )
            .map_err(|e| TutorError::Storage(format!("install_version (version index): {e}")))?;

            tx.commit()
                .map_err(|e| TutorError::Storage(format!("commit tx: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Fetches the installed-version record for a `(subject, grade)` pair.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_installed_version(
        &self,
        subject_id: SubjectId,
        grade: Grade,
    ) -> tutor_types::Result<Option<InstalledVersion>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT subject_id, grade, version, checksum, chunk_count, installed_at
                 FROM installed_versions WHERE subject_id = ?1 AND grade = ?2",
                params![subject_id, i64::from(grade.as_u8())],
                row_to_installed_version,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_installed_version: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    // ---- Chat -------------------------------------------------------------

    /// Appends an immutable chat turn.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn append_chat_record(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        question: &str,
        response: &str,
        confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> tutor_types::Result<ChatRecordId> {
        let conn = self.conn()?;
        let (question, response) = (question.to_string(), response.to_string());
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO chat_records (user_id, subject_id, question, response, confidence, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user_id, subject_id, question, response, f64::from(confidence), timestamp.to_rfc3339()],
            )
            .map_err(|e| TutorError::Storage(format!("append_chat_record: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists chat records for `(user, subject)` within `[start, end]`,
    /// oldest first — the feed a weekly report is derived from.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_chat_records_in_range(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> tutor_types::Result<Vec<ChatRecord>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, subject_id, question, response, confidence, timestamp
                     FROM chat_records
                     WHERE user_id = ?1 AND subject_id = ?2 AND timestamp BETWEEN ?3 AND ?4
                     ORDER BY timestamp ASC",
                )
                .map_err(|e| TutorError::Storage(format!("list_chat_records_in_range: {e}")))?;
            let rows = stmt
                .query_map(
                    params![user_id, subject_id, start.to_rfc3339(), end.to_rfc3339()],
                    row_to_chat_record,
                )
                .map_err(|e| TutorError::Storage(format!("list_chat_records_in_range: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_chat_records_in_range: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every chat record with `timestamp > since`, oldest first —
    /// the incremental backup feed (`spec.md` §4.7: "daily incremental
    /// backup of append-only chat ... since the last base").
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_chat_records_since(&self, since: DateTime<Utc>) -> tutor_types::Result<Vec<ChatRecord>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, subject_id, question, response, confidence, timestamp
                     FROM chat_records WHERE timestamp > ?1 ORDER BY timestamp ASC",
                )
                .map_err(|e| TutorError::Storage(format!("list_all_chat_records_since: {e}")))?;
            let rows = stmt
                .query_map(params![since.to_rfc3339()], row_to_chat_record)
                .map_err(|e| TutorError::Storage(format!("list_all_chat_records_since: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_chat_records_since: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every installed-version record across every `(subject, grade)`
    /// — the VKP-metadata half of a backup (full or incremental).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_installed_versions(&self) -> tutor_types::Result<Vec<InstalledVersion>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT subject_id, grade, version, checksum, chunk_count, installed_at FROM installed_versions",
                )
                .map_err(|e| TutorError::Storage(format!("list_all_installed_versions: {e}")))?;
            let rows = stmt
                .query_map([], row_to_installed_version)
                .map_err(|e| TutorError::Storage(format!("list_all_installed_versions: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_installed_versions: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    // ---- Pedagogy -----------------------------------------------------------

    /// Fetches the mastery row for `(user, subject, topic)`, if it exists.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn get_topic_mastery(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        topic: &str,
    ) -> tutor_types::Result<Option<TopicMastery>> {
        let conn = self.conn()?;
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT user_id, subject_id, topic, mastery_level, question_count, correct_count, average_complexity, last_interaction
                 FROM topic_mastery WHERE user_id = ?1 AND subject_id = ?2 AND topic = ?3",
                params![user_id, subject_id, topic],
                row_to_mastery,
            )
            .optional()
            .map_err(|e| TutorError::Storage(format!("get_topic_mastery: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Upserts a mastery row (insert or full replace by primary key).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn upsert_topic_mastery(&self, mastery: &TopicMastery) -> tutor_types::Result<()> {
        if !mastery.is_valid() {
            return Err(TutorError::Internal(
                "refusing to persist an out-of-bounds mastery row".into(),
            ));
        }
        let conn = self.conn()?;
        let m = mastery.clone();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO topic_mastery (user_id, subject_id, topic, mastery_level, question_count, correct_count, average_complexity, last_interaction)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(user_id, subject_id, topic) DO UPDATE SET
                    mastery_level = excluded.mastery_level,
                    question_count = excluded.question_count,
                    correct_count = excluded.correct_count,
                    average_complexity = excluded.average_complexity,
                    last_interaction = excluded.last_interaction",
                params![
                    m.user_id,
                    m.subject_id,
                    m.topic,
                    m.mastery_level,
                    m.question_count,
                    m.correct_count,
                    m.average_complexity,
                    m.last_interaction.to_rfc3339()
                ],
            )
            .map_err(|e| TutorError::Storage(format!("upsert_topic_mastery: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every mastery row for `(user, subject)`.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_topic_mastery(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
    ) -> tutor_types::Result<Vec<TopicMastery>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, subject_id, topic, mastery_level, question_count, correct_count, average_complexity, last_interaction
                     FROM topic_mastery WHERE user_id = ?1 AND subject_id = ?2",
                )
                .map_err(|e| TutorError::Storage(format!("list_topic_mastery: {e}")))?;
            let rows = stmt
                .query_map(params![user_id, subject_id], row_to_mastery)
                .map_err(|e| TutorError::Storage(format!("list_topic_mastery: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_topic_mastery: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Replaces the weak-area row for `(user, subject, topic)` (weak areas
    /// are regenerated wholesale, not incrementally maintained, per
    /// `spec.md` §3).
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn upsert_weak_area(&self, weak: &WeakArea) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let w = weak.clone();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO weak_areas (user_id, subject_id, topic, weakness_score, recommended_practice)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, subject_id, topic) DO UPDATE SET
                    weakness_score = excluded.weakness_score,
                    recommended_practice = excluded.recommended_practice",
                params![w.user_id, w.subject_id, w.topic, w.weakness_score, w.recommended_practice],
            )
            .map_err(|e| TutorError::Storage(format!("upsert_weak_area: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Deletes the weak-area row for `(user, subject, topic)` — used when a
    /// regeneration pass determines the topic is no longer weak.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn delete_weak_area(&self, user_id: UserId, subject_id: SubjectId, topic: &str) -> tutor_types::Result<()> {
        let conn = self.conn()?;
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "DELETE FROM weak_areas WHERE user_id = ?1 AND subject_id = ?2 AND topic = ?3",
                params![user_id, subject_id, topic],
            )
            .map_err(|e| TutorError::Storage(format!("delete_weak_area: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every weak area flagged for `(user, subject)`.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_weak_areas(&self, user_id: UserId, subject_id: SubjectId) -> tutor_types::Result<Vec<WeakArea>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, subject_id, topic, weakness_score, recommended_practice
                     FROM weak_areas WHERE user_id = ?1 AND subject_id = ?2",
                )
                .map_err(|e| TutorError::Storage(format!("list_weak_areas: {e}")))?;
            let rows = stmt
                .query_map(params![user_id, subject_id], row_to_weak_area)
                .map_err(|e| TutorError::Storage(format!("list_weak_areas: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_weak_areas: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every mastery row in the store, for a full backup snapshot.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_topic_mastery(&self) -> tutor_types::Result<Vec<TopicMastery>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT user_id, subject_id, topic, mastery_level, question_count, correct_count, average_complexity, last_interaction
                     FROM topic_mastery",
                )
                .map_err(|e| TutorError::Storage(format!("list_all_topic_mastery: {e}")))?;
            let rows = stmt
                .query_map([], row_to_mastery)
                .map_err(|e| TutorError::Storage(format!("list_all_topic_mastery: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_topic_mastery: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every weak-area row in the store, for a full backup snapshot.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_weak_areas(&self) -> tutor_types::Result<Vec<WeakArea>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare("SELECT user_id, subject_id, topic, weakness_score, recommended_practice FROM weak_areas")
                .map_err(|e| TutorError::Storage(format!("list_all_weak_areas: {e}")))?;
            let rows = stmt
                .query_map([], row_to_weak_area)
                .map_err(|e| TutorError::Storage(format!("list_all_weak_areas: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_weak_areas: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Inserts a new practice question into the durable, reusable pool.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn insert_practice_question(
        &self,
        subject_id: SubjectId,
        topic: &str,
        difficulty: Difficulty,
        question: &str,
        answer: &str,
    ) -> tutor_types::Result<PracticeQuestionId> {
        let conn = self.conn()?;
        let (topic, question, answer) = (topic.to_string(), question.to_string(), answer.to_string());
        let difficulty_s = difficulty_to_str(difficulty).to_string();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO practice_questions (subject_id, topic, difficulty, question, answer) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![subject_id, topic, difficulty_s, question, answer],
            )
            .map_err(|e| TutorError::Storage(format!("insert_practice_question: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every book row in the store, for a full backup snapshot.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_books(&self) -> tutor_types::Result<Vec<Book>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare("SELECT id, subject_id, installed_version, chunk_count, source_filename FROM books")
                .map_err(|e| TutorError::Storage(format!("list_all_books: {e}")))?;
            let rows = stmt
                .query_map([], row_to_book)
                .map_err(|e| TutorError::Storage(format!("list_all_books: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_books: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Lists every practice question in the durable pool, for a full backup
    /// snapshot.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn list_all_practice_questions(&self) -> tutor_types::Result<Vec<PracticeQuestion>> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare("SELECT id, subject_id, topic, difficulty, question, answer FROM practice_questions")
                .map_err(|e| TutorError::Storage(format!("list_all_practice_questions: {e}")))?;
            let rows = stmt
                .query_map([], row_to_practice_question)
                .map_err(|e| TutorError::Storage(format!("list_all_practice_questions: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("list_all_practice_questions: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Captures every row this store owns into one [`MetadataSnapshot`]
    /// (`spec.md` §4.7 "weekly full backup of MetadataStore"). Sessions are
    /// deliberately excluded: they're ephemeral bearer tokens, and a
    /// restored node should require its users to log back in rather than
    /// resurrect possibly-stale tokens.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error from any constituent read.
    pub async fn export_snapshot(&self) -> tutor_types::Result<MetadataSnapshot> {
        Ok(MetadataSnapshot {
            users: self.list_users().await?,
            subjects: self.list_subjects().await?,
            books: self.list_all_books().await?,
            chat_records: self.list_all_chat_records_since(DateTime::<Utc>::MIN_UTC).await?,
            topic_mastery: self.list_all_topic_mastery().await?,
            weak_areas: self.list_all_weak_areas().await?,
            practice_questions: self.list_all_practice_questions().await?,
            installed_versions: self.list_all_installed_versions().await?,
        })
    }

    /// Replaces every row this store owns with `snapshot`'s contents, in one
    /// transaction (`spec.md` §4.7 rollback: "restores the most recent
    /// backup"). Existing rows are deleted first so a restore onto a
    /// non-empty store doesn't leave orphaned data behind; primary keys from
    /// the snapshot are reinserted verbatim so cross-references (e.g.
    /// `chat_records.user_id`) keep pointing at the right row.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error; the transaction rolls
    /// back on any failure, leaving the store exactly as it was before the
    /// call.
    pub async fn restore_snapshot(&self, snapshot: MetadataSnapshot) -> tutor_types::Result<()> {
        let mut conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let tx = conn
                .transaction()
                .map_err(|e| TutorError::Storage(format!("begin tx: {e}")))?;

            for table in [
                "weak_areas",
                "topic_mastery",
                "practice_questions",
                "chat_records",
                "installed_versions",
                "books",
                "subjects",
                "users",
            ] {
                tx.execute(&format!("DELETE FROM {table}"), [])
                    .map_err(|e| TutorError::Storage(format!("restore_snapshot (clear {table}): {e}")))?;
            }

            for u in &snapshot.users {
                tx.execute(
                    "INSERT INTO users (id, username, password_hash, role, display_name) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![u.id, u.username, u.password_hash, u.role.to_string(), u.display_name],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (users): {e}")))?;
            }
            for s in &snapshot.subjects {
                tx.execute(
                    "INSERT INTO subjects (id, grade, name, code) VALUES (?1, ?2, ?3, ?4)",
                    params![s.id, i64::from(s.grade.as_u8()), s.name, s.code],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (subjects): {e}")))?;
            }
            for b in &snapshot.books {
                tx.execute(
                    "INSERT INTO books (id, subject_id, installed_version, chunk_count, source_filename) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        b.id,
                        b.subject_id,
                        b.installed_version.as_ref().map(ToString::to_string),
                        b.chunk_count as i64,
                        b.source_filename
                    ],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (books): {e}")))?;
            }
            for c in &snapshot.chat_records {
                tx.execute(
                    "INSERT INTO chat_records (id, user_id, subject_id, question, response, confidence, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![c.id, c.user_id, c.subject_id, c.question, c.response, f64::from(c.confidence), c.timestamp.to_rfc3339()],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (chat_records): {e}")))?;
            }
            for m in &snapshot.topic_mastery {
                tx.execute(
                    "INSERT INTO topic_mastery (user_id, subject_id, topic, mastery_level, question_count, correct_count, average_complexity, last_interaction) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        m.user_id, m.subject_id, m.topic, m.mastery_level, m.question_count,
                        m.correct_count, m.average_complexity, m.last_interaction.to_rfc3339()
                    ],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (topic_mastery): {e}")))?;
            }
            for w in &snapshot.weak_areas {
                tx.execute(
                    "INSERT INTO weak_areas (user_id, subject_id, topic, weakness_score, recommended_practice) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![w.user_id, w.subject_id, w.topic, w.weakness_score, w.recommended_practice],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (weak_areas): {e}")))?;
            }
            for p in &snapshot.practice_questions {
                tx.execute(
                    "INSERT INTO practice_questions (id, subject_id, topic, difficulty, question, answer) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![p.id, p.subject_id, p.topic, difficulty_to_str(p.difficulty), p.question, p.answer],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (practice_questions): {e}")))?;
            }
            for v in &snapshot.installed_versions {
                tx.execute(
                    "INSERT INTO installed_versions (subject_id, grade, version, checksum, chunk_count, installed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        v.subject_id, i64::from(v.grade.as_u8()), v.version.to_string(), v.checksum,
                        v.chunk_count as i64, v.installed_at.to_rfc3339()
                    ],
                )
                .map_err(|e| TutorError::Storage(format!("restore_snapshot (installed_versions): {e}")))?;
            }

            tx.commit()
                .map_err(|e| TutorError::Storage(format!("commit tx: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Applies only the append-only parts of a backup — new chat records and
    /// changed installed-version rows — without touching anything else
    /// (`spec.md` §4.7 "daily incremental ... of append-only chat and of VKP
    /// metadata changes"). Used to replay incrementals on top of a restored
    /// full backup during rollback.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error; the transaction rolls
    /// back on any failure.
    pub async fn apply_incremental(&self, incremental: IncrementalSnapshot) -> tutor_types::Result<()> {
        let mut conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let tx = conn
                .transaction()
                .map_err(|e| TutorError::Storage(format!("begin tx: {e}")))?;

            for c in &incremental.chat_records {
                tx.execute(
                    "INSERT OR IGNORE INTO chat_records (id, user_id, subject_id, question, response, confidence, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![c.id, c.user_id, c.subject_id, c.question, c.response, f64::from(c.confidence), c.timestamp.to_rfc3339()],
                )
                .map_err(|e| TutorError::Storage(format!("apply_incremental (chat_records): {e}")))?;
            }
            for v in &incremental.installed_versions {
                tx.execute(
                    "INSERT INTO installed_versions (subject_id, grade, version, checksum, chunk_count, installed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(subject_id, grade) DO UPDATE SET
                        version = excluded.version,
                        checksum = excluded.checksum,
                        chunk_count = excluded.chunk_count,
                        installed_at = excluded.installed_at",
                    params![
                        v.subject_id, i64::from(v.grade.as_u8()), v.version.to_string(), v.checksum,
                        v.chunk_count as i64, v.installed_at.to_rfc3339()
                    ],
                )
                .map_err(|e| TutorError::Storage(format!("apply_incremental (installed_versions): {e}")))?;
            }

            tx.commit()
                .map_err(|e| TutorError::Storage(format!("commit tx: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }

    /// Finds practice questions matching `(subject, topic, difficulty)`.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a DB error.
    pub async fn find_practice_questions(
        &self,
        subject_id: SubjectId,
        topic: &str,
        difficulty: Difficulty,
        limit: usize,
    ) -> tutor_types::Result<Vec<PracticeQuestion>> {
        let conn = self.conn()?;
        let topic = topic.to_string();
        let difficulty_s = difficulty_to_str(difficulty).to_string();
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, subject_id, topic, difficulty, question, answer
                     FROM practice_questions WHERE subject_id = ?1 AND topic = ?2 AND difficulty = ?3
                     LIMIT ?4",
                )
                .map_err(|e| TutorError::Storage(format!("find_practice_questions: {e}")))?;
            let rows = stmt
                .query_map(params![subject_id, topic, difficulty_s, limit as i64], row_to_practice_question)
                .map_err(|e| TutorError::Storage(format!("find_practice_questions: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TutorError::Storage(format!("find_practice_questions: {e}")))
        })
        .await
        .map_err(|e| TutorError::Internal(format!("join error: {e}")))?
    }
}

fn difficulty_to_str(d: Difficulty) -> &'static str {
    match d {
        Difficulty::Easy => "easy",
        Difficulty::Medium => "medium",
        Difficulty::Hard => "hard",
    }
}

fn str_to_difficulty(s: &str) -> rusqlite::Result<Difficulty> {
    match s {
        "easy" => Ok(Difficulty::Easy),
        "medium" => Ok(Difficulty::Medium),
        "hard" => Ok(Difficulty::Hard),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown difficulty '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn str_to_role(s: &str) -> rusqlite::Result<Role> {
    match s {
        "student" => Ok(Role::Student),
        "teacher" => Ok(Role::Teacher),
        "admin" => Ok(Role::Admin),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown role '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: str_to_role(&row.get::<_, String>(3)?)?,
        display_name: row.get(4)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        token: row.get(0)?,
        user_id: row.get(1)?,
        created_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
        expires_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
    })
}

fn row_to_subject(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    let grade_u8: i64 = row.get(1)?;
    Ok(Subject {
        id: row.get(0)?,
        #[allow(clippy::cast_possible_truncation)]
        grade: Grade::from_u8(grade_u8 as u8).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(1, "grade out of range".into(), rusqlite::types::Type::Integer)
        })?,
        name: row.get(2)?,
        code: row.get(3)?,
    })
}

fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    let version_s: Option<String> = row.get(2)?;
    Ok(Book {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        installed_version: version_s.and_then(|s| Version::parse(&s).ok()),
        #[allow(clippy::cast_sign_loss)]
        chunk_count: row.get::<_, i64>(3)? as usize,
        source_filename: row.get(4)?,
    })
}

fn row_to_installed_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledVersion> {
    let grade_u8: i64 = row.get(1)?;
    let version_s: String = row.get(2)?;
    Ok(InstalledVersion {
        subject_id: row.get(0)?,
        #[allow(clippy::cast_possible_truncation)]
        grade: Grade::from_u8(grade_u8 as u8).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(1, "grade out of range".into(), rusqlite::types::Type::Integer)
        })?,
        version: Version::parse(&version_s).map_err(|e| {
            rusqlite::Error::InvalidColumnType(2, e.to_string(), rusqlite::types::Type::Text)
        })?,
        checksum: row.get(3)?,
        #[allow(clippy::cast_sign_loss)]
        chunk_count: row.get::<_, i64>(4)? as usize,
        installed_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_chat_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject_id: row.get(2)?,
        question: row.get(3)?,
        response: row.get(4)?,
        #[allow(clippy::cast_possible_truncation)]
        confidence: row.get::<_, f64>(5)? as f32,
        timestamp: parse_rfc3339(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_mastery(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopicMastery> {
    Ok(TopicMastery {
        user_id: row.get(0)?,
        subject_id: row.get(1)?,
        topic: row.get(2)?,
        mastery_level: row.get(3)?,
        #[allow(clippy::cast_sign_loss)]
        question_count: row.get::<_, i64>(4)? as u32,
        #[allow(clippy::cast_sign_loss)]
        correct_count: row.get::<_, i64>(5)? as u32,
        average_complexity: row.get(6)?,
        last_interaction: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn row_to_weak_area(row: &rusqlite::Row<'_>) -> rusqlite::Result<WeakArea> {
    Ok(WeakArea {
        user_id: row.get(0)?,
        subject_id: row.get(1)?,
        topic: row.get(2)?,
        weakness_score: row.get(3)?,
        recommended_practice: row.get(4)?,
    })
}

fn row_to_practice_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<PracticeQuestion> {
    Ok(PracticeQuestion {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        topic: row.get(2)?,
        difficulty: str_to_difficulty(&row.get::<_, String>(3)?)?,
        question: row.get(4)?,
        answer: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MetadataStore {
        let dir = tempfile::tempdir().unwrap();
        MetadataStore::open(dir.path().join("meta.db"), 5, 5, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn user_round_trip() {
        let store = store().await;
        let id = store
            .create_user("budi", "hash", Role::Student, "Budi")
            .await
            .unwrap();
        let found = store.get_user_by_username("budi").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.role, Role::Student);
    }

    #[tokio::test]
    async fn session_sweep_removes_expired_only() {
        let store = store().await;
        let uid = store.create_user("u", "h", Role::Student, "U").await.unwrap();
        let now = Utc::now();
        store.create_session("expired", uid, now, now - chrono::Duration::seconds(1)).await.unwrap();
        store.create_session("valid", uid, now, now + chrono::Duration::hours(1)).await.unwrap();

        let removed = store.sweep_expired_sessions(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session("expired").await.unwrap().is_none());
        assert!(store.get_session("valid").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn install_version_is_atomic_across_book_and_index() {
        let store = store().await;
        let subject_id = store.create_subject(Grade::Ten, "Matematika", "mtk10").await.unwrap();
        let v = Version::parse("1.0.0").unwrap();
        store
            .install_version(subject_id, Grade::Ten, &v, "sha256:abc", 100, "mtk10.vkp", Utc::now())
            .await
            .unwrap();

        let book = store.get_book_for_subject(subject_id).await.unwrap().unwrap();
        assert_eq!(book.chunk_count, 100);
        let installed = store.get_installed_version(subject_id, Grade::Ten).await.unwrap().unwrap();
        assert_eq!(installed.version, v);
    }

    #[tokio::test]
    async fn update_subject_and_book_edit_in_place() {
        let store = store().await;
        let subject_id = store.create_subject(Grade::Ten, "Matematika", "mtk10").await.unwrap();
        store.update_subject(subject_id, "Matematika Wajib", "mtk10w").await.unwrap();
        let subject = store.get_subject(subject_id).await.unwrap().unwrap();
        assert_eq!(subject.name, "Matematika Wajib");
        assert_eq!(subject.code, "mtk10w");

        store
            .install_version(subject_id, Grade::Ten, &Version::parse("1.0.0").unwrap(), "sha256:abc", 10, "old.vkp", Utc::now())
            .await
            .unwrap();
        store.update_book_filename(subject_id, "new.vkp").await.unwrap();
        let book = store.get_book_for_subject(subject_id).await.unwrap().unwrap();
        assert_eq!(book.source_filename, "new.vkp");
    }

    #[tokio::test]
    async fn mastery_upsert_rejects_invalid_rows() {
        let store = store().await;
        let bad = TopicMastery {
            user_id: 1,
            subject_id: 1,
            topic: "t".into(),
            mastery_level: 2.0,
            question_count: 0,
            correct_count: 0,
            average_complexity: 0.0,
            last_interaction: Utc::now(),
        };
        assert!(store.upsert_topic_mastery(&bad).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_every_table() {
        let store = store().await;
        let uid = store.create_user("siti", "h", Role::Student, "Siti").await.unwrap();
        let subject_id = store.create_subject(Grade::Eleven, "Fisika", "fis11").await.unwrap();
        store
            .install_version(subject_id, Grade::Eleven, &Version::parse("2.0.0").unwrap(), "sha256:x", 10, "fis11.vkp", Utc::now())
            .await
            .unwrap();
        store.append_chat_record(uid, subject_id, "apa itu gaya?", "jawaban", 0.8, Utc::now()).await.unwrap();
        store
            .upsert_topic_mastery(&TopicMastery {
                user_id: uid,
                subject_id,
                topic: "mekanika".into(),
                mastery_level: 0.4,
                question_count: 2,
                correct_count: 1,
                average_complexity: 0.5,
                last_interaction: Utc::now(),
            })
            .await
            .unwrap();

        let snapshot = store.export_snapshot().await.unwrap();
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.chat_records.len(), 1);

        let restored = store().await;
        restored.restore_snapshot(snapshot).await.unwrap();
        assert_eq!(restored.list_users().await.unwrap().len(), 1);
        assert!(restored.get_installed_version(subject_id, Grade::Eleven).await.unwrap().is_some());
        assert_eq!(restored.list_topic_mastery(uid, subject_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_incremental_adds_new_chat_without_touching_other_tables() {
        let store = store().await;
        let uid = store.create_user("u", "h", Role::Student, "U").await.unwrap();
        let subject_id = store.create_subject(Grade::Ten, "Kimia", "kim10").await.unwrap();
        store.append_chat_record(uid, subject_id, "q1", "a1", 0.5, Utc::now()).await.unwrap();

        let incremental = IncrementalSnapshot {
            chat_records: vec![ChatRecord {
                id: 999,
                user_id: uid,
                subject_id,
                question: "q2".into(),
                response: "a2".into(),
                confidence: 0.9,
                timestamp: Utc::now(),
            }],
            installed_versions: vec![],
        };
        store.apply_incremental(incremental).await.unwrap();

        let all = store.list_all_chat_records_since(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
