//! Cancellation scopes for blocking code.
//!
//! A [`CancelToken`] carries the budget of one lexical scope: a relative
//! per-operation timeout, an optional absolute deadline, and the
//! `shielded` / `finished` / `cancelled` flags. Tokens live on a
//! thread-local [`scope`] stack; [`Cancellable`] pushes and pops them
//! around user code.
//!
//! Cancellation is cooperative: `cancel()` sets a flag that blocking code
//! observes at its next [`CancelToken::check`], or when the deadline
//! registered for the token expires and the associated resource is closed
//! out from under the blocked call.

pub mod scope;
mod token;

pub use scope::Cancellable;
pub use token::{CancelToken, Cancelled};
