//! Auto-restart policy for a supervised dependency that fails its health
//! check: up to 3 attempts within a 5-minute cooldown window, then
//! escalation instead of further retries (`spec.md` §4.7).

use crate::health::ProbeStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_ATTEMPTS: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// The external channel a supervisor escalates to once it gives up
/// retrying a dependency — an out-of-core-scope collaborator (`spec.md`
/// §6's stance on the uploader/notification boundary): only the trigger
/// point is specified here, not the transport.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn notify_escalation(&self, probe_name: &str, attempts: u32);
}

/// A `NotificationHook` that only logs, for nodes with no external
/// notification channel configured.
pub struct LoggingNotificationHook;

#[async_trait]
impl NotificationHook for LoggingNotificationHook {
    async fn notify_escalation(&self, probe_name: &str, attempts: u32) {
        tracing::error!(probe_name, attempts, "auto-restart exhausted; escalating");
    }
}

#[derive(Debug, Clone, Copy)]
struct RestartHistory {
    attempts: u32,
    window_started_at: Instant,
    escalated: bool,
}

/// What a supervisor decided to do after observing one probe's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// The probe is healthy; nothing to do.
    NoAction,
    /// A restart was attempted (the `n`th in the current cooldown window).
    Restarted { attempt: u32 },
    /// The probe is unhealthy but already escalated this window; no further
    /// restarts are attempted until the cooldown elapses.
    AlreadyEscalated,
    /// This observation crossed `MAX_ATTEMPTS`; the hook was notified and no
    /// restart was attempted.
    Escalated,
}

/// Tracks restart attempts per probe name, process-local (`spec.md` §4.7
/// "restart history is process-local"; it does not survive a process
/// restart and is not itself backed up).
pub struct Supervisor {
    history: Mutex<HashMap<String, RestartHistory>>,
    hook: Arc<dyn NotificationHook>,
}

impl Supervisor {
    #[must_use]
    pub fn new(hook: Arc<dyn NotificationHook>) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            hook,
        }
    }

    /// Observes one probe's status and, if it's critical, runs `restart`
    /// up to `MAX_ATTEMPTS` times per 5-minute window before escalating via
    /// the configured [`NotificationHook`] instead of retrying further.
    pub async fn observe<F, Fut>(&self, probe_name: &str, status: ProbeStatus, restart: F) -> SupervisorAction
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if status != ProbeStatus::Critical {
            self.history.lock().remove(probe_name);
            return SupervisorAction::NoAction;
        }

        let decision = {
            let mut history = self.history.lock();
            let now = Instant::now();
            let entry = history.entry(probe_name.to_string()).or_insert(RestartHistory {
                attempts: 0,
                window_started_at: now,
                escalated: false,
            });

            if now.duration_since(entry.window_started_at) > COOLDOWN {
                entry.attempts = 0;
                entry.window_started_at = now;
                entry.escalated = false;
            }

            if entry.escalated {
                Decision::AlreadyEscalated
            } else if entry.attempts >= MAX_ATTEMPTS {
                entry.escalated = true;
                Decision::Escalate
            } else {
                entry.attempts += 1;
                Decision::Restart(entry.attempts)
            }
        };

        match decision {
            Decision::AlreadyEscalated => SupervisorAction::AlreadyEscalated,
            Decision::Escalate => {
                self.hook.notify_escalation(probe_name, MAX_ATTEMPTS).await;
                SupervisorAction::Escalated
            }
            Decision::Restart(attempt) => {
                restart().await;
                SupervisorAction::Restarted { attempt }
            }
        }
    }
}

enum Decision {
    Restart(u32),
    Escalate,
    AlreadyEscalated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHook {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationHook for CountingHook {
        async fn notify_escalation(&self, _probe_name: &str, _attempts: u32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn healthy_probe_takes_no_action_and_clears_history() {
        let hook = Arc::new(CountingHook { calls: AtomicU32::new(0) });
        let supervisor = Supervisor::new(hook);
        let action = supervisor.observe("inference_engine", ProbeStatus::Ok, || async {}).await;
        assert_eq!(action, SupervisorAction::NoAction);
    }

    #[tokio::test]
    async fn restarts_up_to_three_times_then_escalates_and_stops_retrying() {
        let hook = Arc::new(CountingHook { calls: AtomicU32::new(0) });
        let supervisor = Supervisor::new(hook.clone());

        let restart_count = Arc::new(AtomicU32::new(0));
        for expected_attempt in 1..=3 {
            let counter = restart_count.clone();
            let action = supervisor
                .observe("vector_store", ProbeStatus::Critical, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            assert_eq!(action, SupervisorAction::Restarted { attempt: expected_attempt });
        }
        assert_eq!(restart_count.load(Ordering::SeqCst), 3);

        let action = supervisor
            .observe("vector_store", ProbeStatus::Critical, || async {})
            .await;
        assert_eq!(action, SupervisorAction::Escalated);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);

        // Further critical observations in the same window don't re-notify.
        let action = supervisor
            .observe("vector_store", ProbeStatus::Critical, || async {})
            .await;
        assert_eq!(action, SupervisorAction::AlreadyEscalated);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn separate_probes_have_independent_histories() {
        let hook = Arc::new(CountingHook { calls: AtomicU32::new(0) });
        let supervisor = Supervisor::new(hook);

        let a = supervisor.observe("inference_engine", ProbeStatus::Critical, || async {}).await;
        let b = supervisor.observe("metadata_store", ProbeStatus::Critical, || async {}).await;
        assert_eq!(a, SupervisorAction::Restarted { attempt: 1 });
        assert_eq!(b, SupervisorAction::Restarted { attempt: 1 });
    }
}
