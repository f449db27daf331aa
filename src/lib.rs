//! Blocking I/O with watchdog-driven timeouts and cancellation scopes.
//!
//! Plain blocking sockets have no fine-grained deadline support: once a
//! thread enters `read` or `write`, nothing short of closing the socket
//! gets it back. This crate makes that mechanism systematic. Operations
//! register an absolute fire-time in a process-wide deadline queue; a
//! single watchdog thread sleeps until the earliest deadline and, when
//! one elapses, runs its expiry callback — closing the resource and
//! forcibly unblocking the stuck thread. When no timeout is configured,
//! an operation costs nothing beyond the call itself.
//!
//! Cancellation budgets travel in thread-local scopes
//! ([`Cancellable`]); timed adapters ([`TimedReader`], [`TimedWriter`])
//! apply them to every raw I/O call, splitting large writes into bounded
//! chunks so a slow-but-progressing peer is not killed mid-transfer.

pub mod clock;
mod errors;
pub mod io;
pub mod net;
pub mod secure;
pub mod socks;
pub mod timeout;

pub use cancellation_scope::{scope, CancelToken, Cancellable, Cancelled};
pub use errors::Error;
pub use io::{
    Buffer, Duplex, RawReader, RawWriter, TimedReader, TimedWriter, CHUNK_CEILING, SEGMENT_SIZE,
};
pub use net::{
    EndpointOptions, ProtocolFamily, Proxy, ProxyCredentials, TargetAddr, TcpEndpoint, TcpServer,
};
pub use secure::SecureString;
pub use socks::SocksError;
pub use timeout::{AsyncTimeout, TimeoutHandle};
