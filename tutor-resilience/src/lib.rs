//! Backups, rollback, health checks, and auto-restart for a single edge
//! tutor node (`spec.md` §4.7).
//!
//! [`backup`] and [`snapshot`] split bundle-plus-sidecar persistence from
//! compression/encryption; [`health`] follows a probe-and-classify shape
//! against this system's literal warn-80%/critical-90%-of-capacity
//! thresholds; [`supervisor`] tracks restart attempts as a policy object
//! wrapping a process-local `HashMap`, per `spec.md` §4.7's retry policy.

pub mod backup;
pub mod health;
pub mod rollback;
pub mod snapshot;
pub mod supervisor;

pub use backup::{BackupConfig, BackupManager};
pub use health::{HealthChecker, HealthReport, ProbeResult, ProbeStatus};
pub use rollback::{NoopServiceControl, RollbackManager, ServiceControl};
pub use snapshot::{BackupKind, BackupMetadata, BackupPayload};
pub use supervisor::{LoggingNotificationHook, NotificationHook, Supervisor, SupervisorAction};
