//! The backend contract every readiness engine implements.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::code::{Code, Event, Token};

/// Result type for registration operations.
pub type PollResult<T> = Result<T, PollError>;

/// Errors from the readiness engine.
#[derive(Debug, Error)]
pub enum PollError {
    /// The engine reached its configured descriptor ceiling.
    #[error("poller is at capacity ({limit} watched entries)")]
    Capacity {
        /// The configured ceiling.
        limit: usize,
    },

    /// The descriptor is not registered.
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    /// Underlying system call failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Buffer of delivered readiness records, reused across waits.
#[derive(Debug, Default)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    /// Creates a buffer able to report up to `capacity` records per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Clears the buffer. Backends call this at the start of every wait.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Appends one record.
    pub fn push(&mut self, event: Event) {
        self.inner.push(event);
    }

    /// Iterates the delivered records.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.inner.iter()
    }

    /// Number of delivered records.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the last wait delivered nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// A platform readiness engine.
///
/// One implementation exists per native API (epoll, kqueue, event ports,
/// generic poll). The interest-adjustment policy differences between them
/// (`modify` in place, add/remove a second filter, re-associate after every
/// event) are expressed as methods here so the worker and listener never
/// branch on the backend at runtime.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Human-readable backend name, used in thread names and logs.
    const NAME: &'static str;

    /// Creates the engine with a ceiling of `capacity` watched descriptors.
    fn with_capacity(capacity: usize) -> io::Result<Self>;

    /// Registers readiness interest for `fd`.
    ///
    /// Fails with [`PollError::Capacity`] once the configured ceiling is
    /// reached.
    fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()>;

    /// Replaces the registered interest for `fd`.
    fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()>;

    /// Deregisters `code` interest for `fd`.
    fn remove(&self, fd: RawFd, code: Code) -> PollResult<()>;

    /// Blocks up to `timeout` and fills `events` with delivered records.
    ///
    /// Returns the number of records delivered. A timeout is an empty
    /// delivery, not an error; `EINTR` is swallowed.
    fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize>;

    /// Reconciles the registration after an event callback so that write
    /// interest is held iff `want_write`.
    ///
    /// `had_write` is the caller-tracked armed state from before the event.
    fn update_interest(
        &self,
        fd: RawFd,
        token: Token,
        want_write: bool,
        had_write: bool,
    ) -> PollResult<()>;

    /// Re-arms a read-only registration after an event was delivered.
    ///
    /// Only one-shot engines (event ports) do anything here; everywhere
    /// else the registration is persistent and this is a no-op.
    fn rearm_read(&self, _fd: RawFd, _token: Token) -> PollResult<()> {
        Ok(())
    }

    /// Removes every filter held for `fd` at end-of-life.
    fn forget(&self, fd: RawFd, had_write: bool) -> PollResult<()>;
}
