//! The shared watchdog-driven timeout mechanism.
//!
//! An [`AsyncTimeout`] is a deadline slot bound to one resource. Entering
//! it registers a node in the process-wide deadline queue; a single
//! background watchdog thread sleeps until the earliest deadline and runs
//! the node's expiry callback (typically closing the resource, which
//! forcibly unblocks the thread stuck in an OS call on it). Exiting the
//! slot reports whether the watchdog got there first.

use std::{io, marker::PhantomData, sync::Arc, time::Duration};

use cancellation_scope::{scope, CancelToken};

use crate::{
    clock,
    errors::Error,
    io::{RawReader, RawWriter, TimedReader, TimedWriter},
};

pub(crate) mod queue;
pub(crate) mod watchdog;

use queue::DeadlineNode;


/// Proof of a balanced `enter`; consumed by [`AsyncTimeout::exit`].
///
/// Not `Send`: `enter` and `exit` must happen on the same thread, since
/// the temporary-token path manipulates that thread's scope stack.
pub struct TimeoutHandle {
    node: Arc<DeadlineNode>,

    /// Present when `enter` minted a token of its own and pushed it onto
    /// the scope stack; `exit` pops and finishes it.
    temporary: Option<CancelToken>,

    _not_send: PhantomData<*const ()>,
}

impl TimeoutHandle {
    fn token(&self) -> Option<CancelToken> {
        self.node.token().cloned()
    }
}


/// A named deadline slot bound to a specific resource, owning the effect
/// that runs if a deadline expires while the slot is entered.
pub struct AsyncTimeout {
    on_expire: Arc<dyn Fn() -> io::Result<()> + Send + Sync>,
}

impl std::fmt::Debug for AsyncTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTimeout").finish_non_exhaustive()
    }
}

impl AsyncTimeout {
    /// Create a slot whose expiry effect is `on_expire` — typically a
    /// closure shutting down the underlying socket. The effect must be
    /// short, lest it starve other timeouts; failures it reports are
    /// logged and swallowed by the watchdog.
    pub fn new(on_expire: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            on_expire: Arc::new(on_expire),
        }
    }

    /// Register a deadline for the operation about to run.
    ///
    /// With a cancellation scope active on this thread, the scope's token
    /// supplies the fire-time (the earlier of its deadline and its
    /// per-operation timeout); a token with no budget registers nothing.
    /// Without a scope, a nonzero `default_timeout` mints a temporary
    /// token that lives until the matching [`exit`][Self::exit].
    ///
    /// Returns `None` when there is nothing to enforce.
    pub fn enter(&self, default_timeout: Duration) -> Option<TimeoutHandle> {
        let now = clock::now_nanos();

        if let Some(token) = scope::current() {
            if token.is_finished() {
                return None;
            }
            let fire_at = token.fire_time(now)?;

            let node = Arc::new(DeadlineNode::new(
                fire_at,
                Arc::clone(&self.on_expire),
                Some(token),
            ));
            watchdog::enqueue(Arc::clone(&node));

            return Some(TimeoutHandle {
                node,
                temporary: None,
                _not_send: PhantomData,
            });
        }

        if default_timeout.is_zero() {
            return None;
        }

        let token = CancelToken::with_timeout(default_timeout);
        let fire_at = token.fire_time(now)?;
        scope::push(token.clone());

        let node = Arc::new(DeadlineNode::new(
            fire_at,
            Arc::clone(&self.on_expire),
            Some(token.clone()),
        ));
        watchdog::enqueue(Arc::clone(&node));

        Some(TimeoutHandle {
            node,
            temporary: Some(token),
            _not_send: PhantomData,
        })
    }

    /// Deregister the deadline registered by the matching
    /// [`enter`][Self::enter].
    ///
    /// Returns `true` iff the watchdog claimed the node first — the
    /// operation timed out and the expiry effect has run or is about to.
    pub fn exit(&self, handle: TimeoutHandle) -> bool {
        let removed = watchdog::dequeue(&handle.node);

        if let Some(token) = handle.temporary {
            scope::pop();
            token.finish();
        }

        !removed
    }

    /// Run `op` under this slot's deadline and translate the outcome.
    ///
    /// A cancelled scope fails with [`Error::Cancelled`] before anything
    /// is registered. If the deadline fired, an error from `op` is
    /// re-thrown as [`Error::Timeout`] with the organic error preserved
    /// as its cause, and a success is converted into a timeout (the
    /// result may be stale; the resource is being closed).
    pub fn with_timeout<T>(
        &self,
        default_timeout: Duration,
        op: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        if scope::cancelled_in_scope() {
            return Err(Error::Cancelled(cancellation_scope::Cancelled));
        }

        let handle = self.enter(default_timeout);
        let token = handle.as_ref().and_then(TimeoutHandle::token);

        let outcome = op();

        let timed_out = match handle {
            Some(handle) => self.exit(handle),
            None => false,
        };

        if !timed_out {
            return outcome;
        }

        match outcome {
            Ok(_stale) => {
                // The deadline fired between the last I/O call and exit.
                if let Some(token) = token {
                    token.cancel();
                }
                Err(Error::Timeout { source: None })
            }
            Err(error) => Err(error.into_timeout()),
        }
    }

    /// Wrap a raw reader so every read runs under this slot's deadline.
    pub fn wrap_reader<R: RawReader>(
        self: &Arc<Self>,
        inner: R,
        read_timeout: Duration,
    ) -> TimedReader<R> {
        TimedReader::new(Arc::clone(self), inner, read_timeout)
    }

    /// Wrap a raw writer so every (chunked) write runs under this slot's
    /// deadline.
    pub fn wrap_writer<W: RawWriter>(
        self: &Arc<Self>,
        inner: W,
        write_timeout: Duration,
    ) -> TimedWriter<W> {
        TimedWriter::new(Arc::clone(self), inner, write_timeout)
    }
}
