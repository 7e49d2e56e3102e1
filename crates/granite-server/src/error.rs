//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
///
/// Transient transport states (would-block, TLS want-read/want-write,
/// partial sends) are not errors; they are expressed in the return types of
/// the transport operations so callers re-enter later.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Readiness engine error.
    #[error("poll error: {0}")]
    Poll(#[from] granite_poll::PollError),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The job pool is exhausted.
    #[error("job pool exhausted")]
    PoolExhausted,
}

impl ServerError {
    /// Returns the OS errno associated with this error, if any.
    ///
    /// Startup failures exit the process with this code.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::BindFailed { source, .. } => source.raw_os_error(),
            Self::Poll(granite_poll::PollError::Io(e)) => e.raw_os_error(),
            _ => None,
        }
    }
}
