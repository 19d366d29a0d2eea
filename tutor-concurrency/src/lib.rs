//! Admits at most `P` inference requests concurrently, queues the rest up
//! to `Q`, and hands every admitted request a streaming token channel and a
//! revocable cancellation (`spec.md` §4.1).
//!
//! A semaphore-gated admission core (`Semaphore::new(max_concurrency)` +
//! `acquire_owned`) with a FIFO wait queue, queue-position reporting, and
//! per-request cancellation.

use dashmap::DashMap;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tutor_types::{Result, TutorError};
use uuid::Uuid;

pub type RequestId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Waiting,
    Active,
    Done,
}

/// Point-in-time admission statistics (`spec.md` §4.1 "stats()").
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyStats {
    pub active: usize,
    pub queued: usize,
    pub completed_total: u64,
    pub rejected_total: u64,
}

/// A function that performs the actual work once a permit is granted. It
/// receives a [`CancellationToken`] to check between suspension points
/// (`spec.md` §4.1 "token emission does not hold a permit beyond generation
/// completion") and returns a lazy stream of results.
pub type Job<T> = Box<dyn FnOnce(CancellationToken) -> BoxStream<'static, Result<T>> + Send>;

struct Inner {
    semaphore: Arc<Semaphore>,
    max_queue: usize,
    queue_timeout: Duration,
    waiting: Mutex<VecDeque<RequestId>>,
    states: DashMap<RequestId, RequestState>,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl Inner {
    fn queue_position_of(&self, id: RequestId) -> i64 {
        match self.states.get(&id).map(|s| *s) {
            None => -2,
            Some(RequestState::Active) => 0,
            Some(RequestState::Done) => -1,
            Some(RequestState::Waiting) => {
                let waiting = self.waiting.lock();
                waiting.iter().position(|&r| r == id).map_or(-2, |pos| pos as i64 + 1)
            }
        }
    }

    fn remove_from_waiting(&self, id: RequestId) {
        self.waiting.lock().retain(|&r| r != id);
    }
}

/// Admits, queues, and executes requests under a hard parallelism bound
/// (`spec.md` §4.1).
pub struct ConcurrencyCore {
    inner: Arc<Inner>,
}

impl ConcurrencyCore {
    /// `max_concurrent` is `P`; `max_queue` is `Q`; `queue_timeout` bounds
    /// how long a request may wait before being cancelled with `Timeout`.
    #[must_use]
    pub fn new(max_concurrent: usize, max_queue: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_queue,
                queue_timeout,
                waiting: Mutex::new(VecDeque::new()),
                states: DashMap::new(),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                completed_total: AtomicU64::new(0),
                rejected_total: AtomicU64::new(0),
            }),
        }
    }

    /// Admits `job`, or rejects it immediately with
    /// [`TutorError::QueueFull`] when the queue is already at capacity
    /// (`spec.md` §4.1 "Overflow policy"). Submission never blocks beyond a
    /// fast, bounded-queue append.
    pub fn submit<T>(&self, job: Job<T>) -> Result<Handle<T>>
    where
        T: Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let inner = self.inner.clone();
        let task_cancel = cancel_token.clone();

        // Fast path: a permit is immediately available, so this request
        // never occupies a queue slot at all (`spec.md` §4.1 "Admission
        // holds while waiting for a permit" implies queueing only begins
        // once none are free).
        let immediate_permit = self.inner.semaphore.clone().try_acquire_owned().ok();

        let permit = match immediate_permit {
            Some(permit) => Some(permit),
            None => {
                if self.inner.queued.load(Ordering::SeqCst) >= self.inner.max_queue {
                    self.inner.rejected_total.fetch_add(1, Ordering::SeqCst);
                    return Err(TutorError::QueueFull);
                }
                self.inner.states.insert(id, RequestState::Waiting);
                self.inner.waiting.lock().push_back(id);
                self.inner.queued.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        tokio::spawn(async move {
            let permit = match permit {
                Some(permit) => permit,
                None => {
                    let acquired = tokio::select! {
                        biased;
                        () = task_cancel.cancelled() => {
                            inner.remove_from_waiting(id);
                            inner.queued.fetch_sub(1, Ordering::SeqCst);
                            inner.states.insert(id, RequestState::Done);
                            inner.completed_total.fetch_add(1, Ordering::SeqCst);
                            let _ = tx.send(Err(TutorError::Cancelled)).await;
                            return;
                        }
                        () = tokio::time::sleep(inner.queue_timeout) => {
                            inner.remove_from_waiting(id);
                            inner.queued.fetch_sub(1, Ordering::SeqCst);
                            inner.states.insert(id, RequestState::Done);
                            inner.completed_total.fetch_add(1, Ordering::SeqCst);
                            let _ = tx.send(Err(TutorError::Timeout("queue_timeout exceeded while waiting for a permit".into()))).await;
                            return;
                        }
                        permit = inner.semaphore.clone().acquire_owned() => permit,
                    };
                    let Ok(permit) = acquired else {
                        inner.states.insert(id, RequestState::Done);
                        inner.completed_total.fetch_add(1, Ordering::SeqCst);
                        let _ = tx.send(Err(TutorError::Internal("semaphore closed".into()))).await;
                        return;
                    };
                    inner.remove_from_waiting(id);
                    inner.queued.fetch_sub(1, Ordering::SeqCst);
                    permit
                }
            };
            let _permit = permit;

            inner.active.fetch_add(1, Ordering::SeqCst);
            inner.states.insert(id, RequestState::Active);

            let mut stream = job(task_cancel.clone());
            loop {
                if task_cancel.is_cancelled() {
                    let _ = tx.send(Err(TutorError::Cancelled)).await;
                    break;
                }
                match futures::StreamExt::next(&mut stream).await {
                    Some(item) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            inner.active.fetch_sub(1, Ordering::SeqCst);
            inner.states.insert(id, RequestState::Done);
            inner.completed_total.fetch_add(1, Ordering::SeqCst);
        });

        Ok(Handle {
            id,
            inner: self.inner.clone(),
            cancel_token,
            receiver: Some(rx),
        })
    }

    #[must_use]
    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            active: self.inner.active.load(Ordering::SeqCst),
            queued: self.inner.queued.load(Ordering::SeqCst),
            completed_total: self.inner.completed_total.load(Ordering::SeqCst),
            rejected_total: self.inner.rejected_total.load(Ordering::SeqCst),
        }
    }
}

/// A handle to one admitted request (`spec.md` §4.1 "Handle"): its queue
/// position, its token stream, and cancellation.
pub struct Handle<T> {
    id: RequestId,
    inner: Arc<Inner>,
    cancel_token: CancellationToken,
    receiver: Option<mpsc::Receiver<Result<T>>>,
}

impl<T: Send + 'static> Handle<T> {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// `0` while executing, a positive ahead-of-me count while waiting,
    /// `-1` once complete, `-2` if the id is unrecognized (`spec.md` §4.1).
    #[must_use]
    pub fn queue_position(&self) -> i64 {
        self.inner.queue_position_of(self.id)
    }

    /// Idempotent: cancelling an already-cancelled or already-complete
    /// handle is a no-op.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Consumes the handle into its ordered token stream.
    #[must_use]
    pub fn into_stream(mut self) -> BoxStream<'static, Result<T>> {
        let receiver = self.receiver.take().expect("stream taken once");
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(receiver))
    }
}
