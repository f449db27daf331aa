use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::socks::SocksError;


/// Failures surfaced by blocking operations on endpoints, adapters and
/// handshakes.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The deadline governing the operation fired. The resource the
    /// operation was blocked on is being closed asynchronously; a result
    /// obtained alongside this error may be stale.
    #[error("the operation timed out")]
    Timeout {
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("the operation was cancelled")]
    Cancelled(#[from] cancellation_scope::Cancelled),

    #[error("the resource is closed")]
    ClosedResource,

    #[error("unknown host: {host}")]
    UnknownHost { host: String },

    #[error("socket error: {0}")]
    Socket(io::Error),

    #[error("failed to connect: {0}")]
    ConnectFailed(io::Error),

    #[error("SOCKS proxy error: {0}")]
    Socks(#[from] SocksError),

    #[error("unknown service: {service}")]
    UnknownService { service: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap `self` as the cause of a [`Error::Timeout`], unless it already
    /// is one.
    pub(crate) fn into_timeout(self) -> Self {
        match self {
            timeout @ Error::Timeout { .. } => timeout,
            other => Error::Timeout {
                source: Some(Box::new(other)),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
