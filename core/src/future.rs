//! Single-assignment asynchronous result cell.
//!
//! A [`NetworkFuture`] starts PENDING and moves exactly once to COMPLETED,
//! FAILED or CANCELLED. Whichever transition happens first wins; every later
//! attempt is a no-op that reports `false`. The same cell can be consumed three
//! ways:
//!
//! - blocking: [`NetworkFuture::get`] parks the calling thread,
//! - reactive: [`NetworkFuture::on_complete`] registers a listener,
//! - async: `NetworkFuture<T>` implements [`std::future::Future`].
//!
//! Handles are cheap clones of one shared cell, so the caller and the
//! multiplexer can both hold the same future.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{NetworkError, Result};

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Token linking a request to its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Terminal state of a future.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(NetworkError),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(NetworkError::Cancelled),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Slot<T> {
    outcome: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    id: CorrelationId,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Asynchronous single-assignment result handle.
pub struct NetworkFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for NetworkFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for NetworkFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.slot.lock().outcome {
            None => "pending",
            Some(Outcome::Completed(_)) => "completed",
            Some(Outcome::Failed(_)) => "failed",
            Some(Outcome::Cancelled) => "cancelled",
        };
        f.debug_struct("NetworkFuture")
            .field("correlation_id", &self.shared.id)
            .field("state", &state)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for NetworkFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> NetworkFuture<T> {
    /// A PENDING future with a fresh correlation id.
    pub fn new() -> Self {
        Self::with_id(CorrelationId::next())
    }

    pub fn with_id(id: CorrelationId) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                slot: Mutex::new(Slot {
                    outcome: None,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// An already completed future.
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// An already failed future.
    pub fn failed(error: NetworkError) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.shared.id
    }

    /// PENDING -> COMPLETED. Returns false if the future was already terminal.
    pub fn complete(&self, value: T) -> bool {
        self.transition(Outcome::Completed(value))
    }

    /// PENDING -> FAILED. Returns false if the future was already terminal.
    pub fn fail(&self, error: NetworkError) -> bool {
        self.transition(Outcome::Failed(error))
    }

    /// PENDING -> CANCELLED. Returns false when cancellation lost the race to
    /// another terminal transition.
    pub fn cancel(&self) -> bool {
        self.transition(Outcome::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.slot.lock().outcome, Some(Outcome::Cancelled))
    }

    /// The terminal state, if reached.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.slot.lock().outcome.clone()
    }

    /// Non-blocking read of the result.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.outcome().map(Outcome::into_result)
    }

    /// Blocks the calling thread until the future is terminal or `timeout`
    /// elapses.
    ///
    /// Returns the value, the stored error, [`NetworkError::Cancelled`], or
    /// [`NetworkError::Elapsed`] if the wait ran out first. Must not be called
    /// from inside an async task that the completing side depends on.
    pub fn get(&self, timeout: Duration) -> Result<T> {
        // A timeout too large to add to the clock waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.shared.slot.lock();
        while slot.outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.shared.ready.wait(&mut slot),
            }
        }
        match slot.outcome.clone() {
            Some(outcome) => outcome.into_result(),
            None => Err(NetworkError::Elapsed(timeout)),
        }
    }

    /// Registers `listener` to run once on the first terminal transition. If
    /// the future is already terminal the listener runs immediately on the
    /// calling thread.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                listener(&outcome);
            }
            None => slot.listeners.push(Box::new(listener)),
        }
    }

    /// Fails the future with [`NetworkError::Timeout`] if it is still pending
    /// once `deadline` has elapsed.
    ///
    /// Inside a tokio runtime the timer is a task that ends as soon as the
    /// future resolves; elsewhere a helper thread waits on the cell.
    pub fn with_deadline(self, deadline: Duration) -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => self.with_deadline_on(&handle, deadline),
            Err(_) => {
                let watched = self.clone();
                std::thread::spawn(move || {
                    if let Err(NetworkError::Elapsed(_)) = watched.get(deadline) {
                        watched.fail(NetworkError::Timeout(deadline));
                    }
                });
                self
            }
        }
    }

    /// Like [`with_deadline`](Self::with_deadline) with the timer task
    /// spawned on `handle`.
    pub fn with_deadline_on(self, handle: &tokio::runtime::Handle, deadline: Duration) -> Self {
        let watched = self.clone();
        handle.spawn(async move {
            let resolved = watched.clone();
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    if watched.fail(NetworkError::Timeout(deadline)) {
                        debug!(target: "future", correlation_id = %watched.correlation_id(), ?deadline, "Deadline elapsed");
                    }
                }
                _ = resolved => {}
            }
        });
        self
    }

    fn transition(&self, outcome: Outcome<T>) -> bool {
        let (listeners, wakers) = {
            let mut slot = self.shared.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut slot.listeners),
                std::mem::take(&mut slot.wakers),
            )
        };
        self.shared.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(&outcome);
        }
        true
    }
}

impl<T: Clone + Send + 'static> Future for NetworkFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if let Some(outcome) = slot.outcome.clone() {
            return Poll::Ready(outcome.into_result());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_transition_wins() {
        let future = NetworkFuture::<u32>::new();
        assert!(future.complete(7));
        assert!(!future.fail(NetworkError::Cancelled));
        assert!(!future.cancel());
        assert_eq!(future.get(Duration::from_millis(1)), Ok(7));
    }

    #[test]
    fn cancel_reports_cancellation() {
        let future = NetworkFuture::<u32>::new();
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert_eq!(future.get(Duration::ZERO), Err(NetworkError::Cancelled));
        assert!(!future.complete(1));
    }

    #[test]
    fn get_elapses_while_pending() {
        let future = NetworkFuture::<u32>::new();
        let err = future.get(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, NetworkError::Elapsed(Duration::from_millis(20)));
        assert!(!future.is_done());
    }

    #[test]
    fn get_wakes_on_completion_from_another_thread() {
        let future = NetworkFuture::<String>::new();
        let completer = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete("ack".into());
        });
        assert_eq!(future.get(Duration::from_secs(5)).unwrap(), "ack");
        handle.join().unwrap();
    }

    #[test]
    fn unbounded_wait_returns_terminal_outcome() {
        let done = NetworkFuture::completed(1u32);
        assert_eq!(done.get(Duration::MAX), Ok(1));

        let future = NetworkFuture::<u32>::new();
        let completer = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.fail(NetworkError::Transport("link down".into()));
        });
        assert_eq!(
            future.get(Duration::MAX),
            Err(NetworkError::Transport("link down".into()))
        );
        handle.join().unwrap();
    }

    #[test]
    fn listeners_fire_exactly_once() {
        let future = NetworkFuture::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        future.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        future.fail(NetworkError::Transport("down".into()));
        future.complete(3);
        future.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_runs_synchronously() {
        let future = NetworkFuture::completed(5u32);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        future.on_complete(move |outcome| {
            *sink.lock() = Some(outcome.clone());
        });
        assert_eq!(*seen.lock(), Some(Outcome::Completed(5)));
    }

    #[test]
    fn deadline_without_runtime_uses_helper_thread() {
        let future = NetworkFuture::<u32>::new().with_deadline(Duration::from_millis(10));
        let err = future.get(Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, NetworkError::Timeout(Duration::from_millis(10)));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = NetworkFuture::<()>::new();
        let b = NetworkFuture::<()>::new();
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[tokio::test]
    async fn await_and_deadline_inside_runtime() {
        let pending = NetworkFuture::<u32>::new().with_deadline(Duration::from_millis(20));
        assert_eq!(
            pending.await,
            Err(NetworkError::Timeout(Duration::from_millis(20)))
        );

        let future = NetworkFuture::<u32>::new().with_deadline(Duration::from_secs(30));
        let completer = future.clone();
        tokio::spawn(async move {
            completer.complete(9);
        });
        assert_eq!(future.await, Ok(9));
    }
}
