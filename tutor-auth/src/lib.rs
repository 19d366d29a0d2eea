//! Users, password hashing, and session lifecycle.
//!
//! A role-carrying principal and a token-bound, absolute-expiry session
//! lifecycle with periodic sweep, backed by `tutor_storage::MetadataStore`
//! rather than an in-memory session store so sessions survive a restart.

mod service;

pub use service::{AuthService, LoginError};
