use std::{cell::RefCell, time::Duration};

use crate::CancelToken;


thread_local! {
    /// The ordered stack of cancellation tokens active on this thread.
    /// The top of the stack belongs to the innermost scope.
    static SCOPE_STACK: RefCell<Vec<CancelToken>> = const { RefCell::new(Vec::new()) };
}

/// Push a token onto this thread's scope stack.
pub fn push(token: CancelToken) {
    SCOPE_STACK.with(|stack| stack.borrow_mut().push(token));
}

/// Pop the innermost token off this thread's scope stack.
pub fn pop() -> Option<CancelToken> {
    SCOPE_STACK.with(|stack| stack.borrow_mut().pop())
}

/// The innermost token on this thread's scope stack, if any.
pub fn current() -> Option<CancelToken> {
    SCOPE_STACK.with(|stack| stack.borrow().last().cloned())
}

/// The number of tokens currently on this thread's scope stack.
pub fn depth() -> usize {
    SCOPE_STACK.with(|stack| stack.borrow().len())
}

/// Whether cancellation is visible to the innermost scope on this thread.
///
/// Walks the stack from the innermost token outwards. A cancelled token
/// anywhere on the walk means cancelled; a shielded token terminates the
/// walk (after its own flag has been consulted), so cancellation of the
/// scopes enclosing it never propagates inward.
pub fn cancelled_in_scope() -> bool {
    SCOPE_STACK.with(|stack| {
        for token in stack.borrow().iter().rev() {
            if token.is_finished() {
                continue;
            }
            if token.is_cancelled() {
                return true;
            }
            if token.is_shielded() {
                return false;
            }
        }

        false
    })
}

/// Compute the effective absolute fire-time for an operation starting at
/// `now_nanos`: the earlier of the current token's fire-time (if any) and
/// `now + default_timeout` (if the default is nonzero).
///
/// Returns `None` when neither source imposes a bound.
pub fn effective_fire_time(now_nanos: i64, default_timeout: Duration) -> Option<i64> {
    let from_token = current().and_then(|token| token.fire_time(now_nanos));

    let from_default = match default_timeout.as_nanos() as u64 {
        0 => None,
        nanos => Some(now_nanos.wrapping_add(nanos as i64)),
    };

    match (from_token, from_default) {
        (Some(token), Some(default)) => Some(token.min(default)),
        (Some(token), None) => Some(token),
        (None, Some(default)) => Some(default),
        (None, None) => None,
    }
}


/// Pops and finishes the scope's token when the scope is left, including
/// by unwinding.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(token) = pop() {
            token.finish();
        }
    }
}


/// Entry points for running user code inside a cancellation scope.
///
/// Each `run` variant creates a token, pushes it onto the current thread's
/// scope stack, executes the closure with a reference to that token, and
/// pops and finishes the token on the way out.
pub struct Cancellable;

impl Cancellable {
    fn run_with_token<T>(token: CancelToken, f: impl FnOnce(&CancelToken) -> T) -> T {
        // A non-shielded child adopts the enclosing scope's deadline if it
        // is earlier than its own. Deadlines are absolute and scope-wide;
        // relative timeouts are per-operation and are not inherited.
        if !token.is_shielded() {
            if let Some(outer_deadline) = current().and_then(|outer| outer.deadline_nanos()) {
                let inherited = match token.deadline_nanos() {
                    Some(own) => own.min(outer_deadline),
                    None => outer_deadline,
                };
                token.set_deadline_nanos(inherited);
            }
        }

        push(token.clone());
        let _guard = ScopeGuard;

        f(&token)
    }

    /// Run `f` inside a scope with a relative per-operation timeout.
    /// [`Duration::ZERO`] means unlimited.
    pub fn run<T>(timeout: Duration, f: impl FnOnce(&CancelToken) -> T) -> T {
        Self::run_with_token(CancelToken::with_timeout(timeout), f)
    }

    /// Run `f` inside a scope with no timeout or deadline of its own.
    pub fn run_forever<T>(f: impl FnOnce(&CancelToken) -> T) -> T {
        Self::run_with_token(CancelToken::forever(), f)
    }

    /// Run `f` inside a shielded scope: cancellation of enclosing scopes
    /// does not propagate inward, but the scope's own timeout applies.
    pub fn run_shielded<T>(timeout: Duration, f: impl FnOnce(&CancelToken) -> T) -> T {
        let token = CancelToken::with_timeout(timeout);
        token.shield();
        Self::run_with_token(token, f)
    }
}


#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn run_pushes_and_pops_the_scope_stack() {
        assert_eq!(depth(), 0);

        Cancellable::run_forever(|_token| {
            assert_eq!(depth(), 1);
            assert!(current().is_some());
        });

        assert_eq!(depth(), 0);
        assert!(current().is_none());
    }

    #[test]
    fn token_is_finished_after_the_scope_exits() {
        let token = Cancellable::run(Duration::from_secs(1), |token| token.clone());
        assert!(token.is_finished());
    }

    #[test]
    fn scope_stack_is_restored_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            Cancellable::run_forever(|_token| panic!("scope body failed"));
        });

        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn cancellation_of_an_outer_scope_is_visible_in_a_nested_scope() {
        Cancellable::run_forever(|outer| {
            outer.cancel();

            Cancellable::run_forever(|_inner| {
                assert!(cancelled_in_scope());
            });
        });
    }

    #[test]
    fn shielded_scope_masks_outer_cancellation() {
        Cancellable::run_forever(|outer| {
            outer.cancel();

            Cancellable::run_shielded(Duration::ZERO, |_inner| {
                assert!(!cancelled_in_scope());
            });
        });
    }

    #[test]
    fn shielded_scope_still_observes_its_own_cancellation() {
        Cancellable::run_shielded(Duration::ZERO, |inner| {
            inner.cancel();
            assert!(cancelled_in_scope());
        });
    }

    #[test]
    fn nested_scope_inherits_the_earlier_outer_deadline() {
        Cancellable::run_forever(|outer| {
            outer.set_deadline_nanos(1_000);

            Cancellable::run_forever(|inner| {
                assert_matches!(inner.deadline_nanos(), Some(1_000));
            });

            Cancellable::run(Duration::from_secs(1), |inner| {
                inner.set_deadline_nanos(5_000);
                // Inheritance happened at entry; the later own deadline at
                // this point is the caller's choice to keep.
                assert_matches!(inner.deadline_nanos(), Some(5_000));
            });
        });
    }

    #[test]
    fn shielded_scope_does_not_inherit_the_outer_deadline() {
        Cancellable::run_forever(|outer| {
            outer.set_deadline_nanos(1_000);

            Cancellable::run_shielded(Duration::ZERO, |inner| {
                assert_matches!(inner.deadline_nanos(), None);
            });
        });
    }

    #[test]
    fn effective_fire_time_combines_token_and_default() {
        Cancellable::run_forever(|token| {
            token.set_deadline_nanos(2_000);

            assert_matches!(
                effective_fire_time(0, Duration::from_nanos(500)),
                Some(500)
            );
            assert_matches!(
                effective_fire_time(0, Duration::from_nanos(9_000)),
                Some(2_000)
            );
            assert_matches!(effective_fire_time(0, Duration::ZERO), Some(2_000));
        });

        assert_matches!(effective_fire_time(0, Duration::ZERO), None);
        assert_matches!(effective_fire_time(0, Duration::from_nanos(7)), Some(7));
    }
}
