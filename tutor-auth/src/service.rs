use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tutor_storage::MetadataStore;
use tutor_types::{Result, Role, Session, TutorError, User, UserId};
use uuid::Uuid;

/// Why a login attempt was refused. Kept distinct from [`TutorError`] so
/// callers can decide whether to log the username (never the password) at
/// `warn` without reaching into string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    UnknownUser,
    WrongPassword,
}

impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownUser => f.write_str("unknown username"),
            Self::WrongPassword => f.write_str("incorrect password"),
        }
    }
}

/// Registration, login, logout, and session validation over
/// `tutor_storage::MetadataStore`.
///
/// Session tokens are opaque v4 UUIDs carrying no claims of their own —
/// every validation round-trips through the store rather than decoding a
/// self-contained token.
pub struct AuthService {
    metadata_store: Arc<MetadataStore>,
    session_ttl: Duration,
}

impl AuthService {
    #[must_use]
    pub fn new(metadata_store: Arc<MetadataStore>, session_ttl: Duration) -> Self {
        Self {
            metadata_store,
            session_ttl,
        }
    }

    /// Hashes `password` with bcrypt and creates the user row.
    ///
    /// # Errors
    /// Returns [`TutorError::Storage`] on a duplicate username or DB error,
    /// or [`TutorError::Internal`] if hashing fails.
    pub async fn register_user(&self, username: &str, password: &str, role: Role, display_name: &str) -> Result<UserId> {
        let password_hash =
            hash(password, DEFAULT_COST).map_err(|e| TutorError::Internal(format!("password hashing failed: {e}")))?;
        self.metadata_store
            .create_user(username, &password_hash, role, display_name)
            .await
    }

    /// Verifies credentials and, on success, issues a new session.
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] wrapping a [`LoginError`] on bad
    /// credentials, or propagates a storage error.
    pub async fn login(&self, username: &str, password: &str, now: DateTime<Utc>) -> Result<Session> {
        let user = self
            .metadata_store
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| TutorError::Auth(LoginError::UnknownUser.to_string()))?;

        let matches = verify(password, &user.password_hash)
            .map_err(|e| TutorError::Internal(format!("password verification failed: {e}")))?;
        if !matches {
            return Err(TutorError::Auth(LoginError::WrongPassword.to_string()));
        }

        let token = Uuid::new_v4().to_string();
        let expires_at = now + self.session_ttl;
        self.metadata_store.create_session(&token, user.id, now, expires_at).await?;

        Ok(Session {
            token,
            user_id: user.id,
            created_at: now,
            expires_at,
        })
    }

    /// Deletes the session bound to `token`. Idempotent: logging out twice
    /// (or logging out a token that already expired and was swept) is not
    /// an error.
    ///
    /// # Errors
    /// Propagates a storage error.
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.metadata_store.delete_session(token).await
    }

    /// Resolves a bearer token to its user, rejecting expired sessions
    /// without requiring the sweep to have run first.
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if the token is unknown or expired, or
    /// propagates a storage error.
    pub async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<User> {
        let session = self
            .metadata_store
            .get_session(token)
            .await?
            .ok_or_else(|| TutorError::Auth("unknown or revoked session".into()))?;
        if session.is_expired(now) {
            return Err(TutorError::Auth("session expired".into()));
        }

        let users = self.metadata_store.list_users().await?;
        users
            .into_iter()
            .find(|u| u.id == session.user_id)
            .ok_or_else(|| TutorError::Auth("session refers to a deleted user".into()))
    }

    /// Enforces that `user` holds at least `minimum` privilege, under the
    /// fixed ordering `student < teacher < admin` (`spec.md` §3).
    ///
    /// # Errors
    /// Returns [`TutorError::Auth`] if the user's role is below `minimum`.
    pub fn require_role(user: &User, minimum: Role) -> Result<()> {
        if role_rank(user.role) >= role_rank(minimum) {
            Ok(())
        } else {
            Err(TutorError::Auth(format!(
                "{} requires role >= {minimum}, user has {}",
                user.username, user.role
            )))
        }
    }

    /// Deletes every session whose `expires_at` has passed `now`. Intended
    /// to run on the same periodic-trigger contract as the VKP puller.
    ///
    /// # Errors
    /// Propagates a storage error.
    pub async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.metadata_store.sweep_expired_sessions(now).await
    }
}

const fn role_rank(role: Role) -> u8 {
    match role {
        Role::Student => 0,
        Role::Teacher => 1,
        Role::Admin => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_storage::MetadataStore;

    async fn store() -> Arc<MetadataStore> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(MetadataStore::open(dir.path().join("meta.db"), 5, 5, std::time::Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn registers_and_logs_in_with_correct_password() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::hours(8));
        auth.register_user("budi", "hunter2", Role::Student, "Budi").await.unwrap();

        let session = auth.login("budi", "hunter2", Utc::now()).await.unwrap();
        assert!(!session.token.is_empty());
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::hours(8));
        auth.register_user("budi", "hunter2", Role::Student, "Budi").await.unwrap();

        let err = auth.login("budi", "wrong", Utc::now()).await.unwrap_err();
        assert!(matches!(err, TutorError::Auth(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_user() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::hours(8));
        let err = auth.login("ghost", "anything", Utc::now()).await.unwrap_err();
        assert!(matches!(err, TutorError::Auth(_)));
    }

    #[tokio::test]
    async fn authenticate_resolves_a_live_session_and_rejects_after_expiry() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::seconds(1));
        auth.register_user("siti", "pw", Role::Teacher, "Siti").await.unwrap();
        let now = Utc::now();
        let session = auth.login("siti", "pw", now).await.unwrap();

        let user = auth.authenticate(&session.token, now).await.unwrap();
        assert_eq!(user.username, "siti");

        let later = now + Duration::seconds(2);
        let err = auth.authenticate(&session.token, later).await.unwrap_err();
        assert!(matches!(err, TutorError::Auth(_)));
    }

    #[tokio::test]
    async fn logout_revokes_the_session_immediately() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::hours(8));
        auth.register_user("admin1", "pw", Role::Admin, "Admin").await.unwrap();
        let now = Utc::now();
        let session = auth.login("admin1", "pw", now).await.unwrap();

        auth.logout(&session.token).await.unwrap();
        let err = auth.authenticate(&session.token, now).await.unwrap_err();
        assert!(matches!(err, TutorError::Auth(_)));

        // Idempotent: logging out again is not an error.
        auth.logout(&session.token).await.unwrap();
    }

    #[test]
    fn require_role_enforces_the_fixed_ordering() {
        let student = User {
            id: 1,
            username: "s".into(),
            password_hash: String::new(),
            role: Role::Student,
            display_name: "S".into(),
        };
        let admin = User {
            id: 2,
            username: "a".into(),
            password_hash: String::new(),
            role: Role::Admin,
            display_name: "A".into(),
        };

        assert!(AuthService::require_role(&admin, Role::Teacher).is_ok());
        assert!(AuthService::require_role(&student, Role::Teacher).is_err());
        assert!(AuthService::require_role(&student, Role::Student).is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let store = store().await;
        let auth = AuthService::new(store, Duration::seconds(1));
        auth.register_user("u", "pw", Role::Student, "U").await.unwrap();
        let now = Utc::now();
        let session = auth.login("u", "pw", now).await.unwrap();

        let swept = auth.sweep_expired_sessions(now).await.unwrap();
        assert_eq!(swept, 0);

        let later = now + Duration::seconds(5);
        let swept = auth.sweep_expired_sessions(later).await.unwrap();
        assert_eq!(swept, 1);

        let err = auth.authenticate(&session.token, later).await.unwrap_err();
        assert!(matches!(err, TutorError::Auth(_)));
    }
}
