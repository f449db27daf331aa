use std::{
    error::Error,
    fmt::{self, Display},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;


/// Error returned when an operation observes that its scope has been cancelled.
///
/// Usually surfaced as `Result<T, Cancelled>` from [`CancelToken::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the operation was cancelled")
    }
}

impl Error for Cancelled {}

impl From<Cancelled> for io::Error {
    fn from(cancelled: Cancelled) -> Self {
        io::Error::new(io::ErrorKind::TimedOut, cancelled)
    }
}


/// The mutable budget of a token. Guarded by a mutex so that mutation from
/// another thread (a manual `cancel()`, a timed adapter swapping the
/// per-operation timeout, `finish()` on scope exit) is serialised.
pub(crate) struct TokenBudget {
    /// Relative per-operation budget in nanoseconds. Zero means unlimited.
    pub(crate) timeout_nanos: u64,

    /// Absolute monotonic fire-time in nanoseconds. Zero means no deadline.
    pub(crate) deadline_nanos: i64,

    /// A shielded token masks cancellation coming from enclosing scopes.
    /// Its own budget still applies.
    pub(crate) shielded: bool,

    /// Set on scope exit. A finished token is inert in all queries.
    pub(crate) finished: bool,
}

/// Internal token state, shared between all clones of a [`CancelToken`].
pub(crate) struct TokenState {
    /// Atomic cancellation flag. Once set to `true` it is impossible to
    /// reset by normal means.
    pub(crate) cancelled: AtomicBool,

    pub(crate) budget: Mutex<TokenBudget>,
}


/// A cancellation token carrying the budget of one lexical scope.
///
/// # Cloning
///
/// Clones share the underlying state; cancelling one clone is observed by
/// all of them.
///
/// # Invariants
///
/// - Once `cancelled` is set it is never unset.
/// - Once `finished` is set it is never unset.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    fn with_budget(budget: TokenBudget) -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                budget: Mutex::new(budget),
            }),
        }
    }

    /// Initialize a token with a relative per-operation timeout.
    /// [`Duration::ZERO`] means unlimited.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_budget(TokenBudget {
            timeout_nanos: timeout.as_nanos() as u64,
            deadline_nanos: 0,
            shielded: false,
            finished: false,
        })
    }

    /// Initialize a token with neither a timeout nor a deadline.
    pub fn forever() -> Self {
        Self::with_timeout(Duration::ZERO)
    }

    /// Check whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Mark this token (and all linked clones) as cancelled.
    ///
    /// Cancellation does **not** interrupt an in-flight blocking OS call by
    /// itself. It becomes visible at the next [`check`][Self::check], or
    /// when the deadline associated with this token expires and the watchdog
    /// closes the underlying resource.
    ///
    /// Cancelling an already-cancelled token is a no-op.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Return `Err(Cancelled)` if the token has been cancelled and is not
    /// yet finished.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_finished() {
            return Ok(());
        }

        match self.is_cancelled() {
            true => Err(Cancelled),
            false => Ok(()),
        }
    }

    /// Mark the token as finished. After this the token is a no-op in all
    /// queries; its flags are retained but no longer enforced.
    pub fn finish(&self) {
        self.state.budget.lock().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state.budget.lock().finished
    }

    pub fn is_shielded(&self) -> bool {
        self.state.budget.lock().shielded
    }

    /// Mark the token as shielded: cancellation of enclosing scopes no
    /// longer propagates to it. Its own budget still applies.
    pub fn shield(&self) {
        self.state.budget.lock().shielded = true;
    }

    /// The relative per-operation timeout. [`Duration::ZERO`] means
    /// unlimited.
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.state.budget.lock().timeout_nanos)
    }

    /// Replace the per-operation timeout, returning the previous value.
    ///
    /// Timed adapters use this to temporarily impose their configured
    /// default on the current scope, restoring the old value afterwards.
    pub fn set_timeout(&self, timeout: Duration) -> Duration {
        let mut budget = self.state.budget.lock();

        let previous = budget.timeout_nanos;
        budget.timeout_nanos = timeout.as_nanos() as u64;

        Duration::from_nanos(previous)
    }

    /// The absolute monotonic deadline in nanoseconds, if one is set.
    pub fn deadline_nanos(&self) -> Option<i64> {
        match self.state.budget.lock().deadline_nanos {
            0 => None,
            deadline => Some(deadline),
        }
    }

    /// Set an absolute monotonic deadline in nanoseconds.
    pub fn set_deadline_nanos(&self, deadline_nanos: i64) {
        self.state.budget.lock().deadline_nanos = deadline_nanos;
    }

    /// Compute the absolute fire-time this token imposes on an operation
    /// starting at `now_nanos`: the earlier of the token's deadline (if
    /// set) and `now + timeout` (if the timeout is nonzero).
    ///
    /// Returns `None` when the token is finished or carries neither a
    /// deadline nor a timeout.
    pub fn fire_time(&self, now_nanos: i64) -> Option<i64> {
        let budget = self.state.budget.lock();

        if budget.finished {
            return None;
        }

        let from_timeout = match budget.timeout_nanos {
            0 => None,
            timeout => Some(now_nanos.wrapping_add(timeout as i64)),
        };

        let from_deadline = match budget.deadline_nanos {
            0 => None,
            deadline => Some(deadline),
        };

        match (from_timeout, from_deadline) {
            (Some(timeout), Some(deadline)) => Some(timeout.min(deadline)),
            (Some(timeout), None) => Some(timeout),
            (None, Some(deadline)) => Some(deadline),
            (None, None) => None,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let budget = self.state.budget.lock();

        f.debug_struct("CancelToken")
            .field("timeout_nanos", &budget.timeout_nanos)
            .field("deadline_nanos", &budget.deadline_nanos)
            .field("shielded", &budget.shielded)
            .field("finished", &budget.finished)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
