//! Per-run shared state: identity, cancellation, progress, outcome.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Identifies one run of a controller. Ids increase with every `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Snapshot of a run's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunProgress {
    /// Matching rows counted at run start.
    pub expected: u64,
    /// Rows handed to the relay buffer so far.
    pub produced: u64,
}

/// State shared between the controller, the producer thread and the drain
/// loop of a single run.
///
/// `cancel_requested` is the only field written by more than one party. The
/// mutex/condvar pair exists solely so a producer sleeping between retries can
/// be woken by [RunState::request_cancel].
#[derive(Debug)]
pub struct RunState {
    id: RunId,
    cancel_requested: AtomicBool,
    total_expected: AtomicU64,
    total_produced: AtomicU64,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

impl RunState {
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            cancel_requested: AtomicBool::new(false),
            total_expected: AtomicU64::new(0),
            total_produced: AtomicU64::new(0),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Sets the cancel flag. Returns `true` only for the first request.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        // Taking the lock orders this notify after any waiter's predicate check.
        let _guard = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake_cv.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`, returning early if the run is cancelled.
    /// Returns whether the run is cancelled.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let guard = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .wake_cv
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_cancelled()
    }

    pub(crate) fn set_expected(&self, expected: u64) {
        self.total_expected.store(expected, Ordering::SeqCst);
    }

    pub(crate) fn add_produced(&self, n: u64) {
        self.total_produced.fetch_add(n, Ordering::SeqCst);
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            expected: self.total_expected.load(Ordering::SeqCst),
            produced: self.total_produced.load(Ordering::SeqCst),
        }
    }
}

/// How a run ended, as observed after its final drain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every matching row was forwarded.
    Completed { forwarded: u64 },
    /// Stopped by `cancel`; nothing was forwarded after the request.
    Cancelled { forwarded: u64 },
    /// A remote call failed. Rows buffered before the failure were forwarded.
    Failed { forwarded: u64, error: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Records delivered to the sink over the whole run.
    pub fn forwarded(&self) -> u64 {
        match self {
            RunOutcome::Completed { forwarded }
            | RunOutcome::Cancelled { forwarded }
            | RunOutcome::Failed { forwarded, .. } => *forwarded,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match self {
            RunOutcome::Failed { error, .. } => Some(error.as_str()),
            _ => None,
        }
    }
}
