//! Per-connection jobs and the pooled job manager.
//!
//! A job binds one transport connection to its HTTP state and the three
//! transmit counters. Jobs live in the manager's fixed slot array for the
//! whole process lifetime; acquire/release only moves slot indices across
//! a mutex-guarded LIFO free list, so the accept hot path never allocates.
//! The slot index doubles as the poller token, which is how a worker finds
//! the job again on each readiness event.

use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, error};

use crate::error::{ServerError, ServerResult};
use crate::http::{HttpState, ResponseKind};
use crate::tls::TlsStatus;
use crate::transport::Conn;

/// Which half of the request/response cycle the job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for (more of) a request.
    Read,
    /// A response is built and being transmitted.
    Write,
}

/// One connection's lifecycle state.
#[derive(Debug)]
pub struct Job {
    /// The transport connection; `None` while the slot is pooled.
    pub conn: Option<Conn>,
    /// HTTP request/response state.
    pub http: HttpState,
    /// Current cycle state.
    pub state: JobState,
    /// Octets of the response head transmitted so far.
    pub sent_head: usize,
    /// Octets of the in-memory body transmitted so far.
    pub sent_body: usize,
    /// Octets of the response file transmitted so far.
    pub sent_file: u64,
    /// Whether the poller currently holds write interest for this job.
    /// Owned by the worker; the interest invariant is
    /// `write_armed == has_more_write()` between events.
    pub write_armed: bool,
}

impl Job {
    fn empty() -> Self {
        Self {
            conn: None,
            http: HttpState::new(),
            state: JobState::Read,
            sent_head: 0,
            sent_body: 0,
            sent_file: 0,
            write_armed: false,
        }
    }

    /// Binds an accepted connection to this slot and zeroes the cycle.
    pub fn begin(&mut self, conn: Conn) {
        self.conn = Some(conn);
        self.http.clear();
        self.state = JobState::Read;
        self.sent_head = 0;
        self.sent_body = 0;
        self.sent_file = 0;
        self.write_armed = false;
    }

    /// Handles a readable event: TLS progression, drain, parse, build.
    ///
    /// Leaves the job in `Read` while the TLS handshake is still in flight
    /// or the peer has not sent anything yet; transitions to `Write` once a
    /// response is ready. Errors mean the job must be finished.
    pub fn read(&mut self, buffer: &mut [u8], root: &Path) -> ServerResult<()> {
        let conn = self.conn.as_mut().ok_or(ServerError::PeerClosed)?;

        // A zero-byte drain normally means the peer went away. On the round
        // where the handshake just completed it only means the request has
        // not arrived yet, so the error is suppressed for that one round.
        let mut treat_empty_as_close = true;
        if conn.is_tls() && !conn.tls_established() {
            match conn.establish_tls()? {
                TlsStatus::Plain => {}
                TlsStatus::InProgress => return Ok(()),
                TlsStatus::Established => treat_empty_as_close = false,
            }
        }

        // A readable event while a response is still being written is the
        // next request on a kept-alive connection; restart the cycle.
        if self.state == JobState::Write {
            self.reset();
        }

        let mut received = 0usize;
        let conn = self.conn.as_mut().ok_or(ServerError::PeerClosed)?;
        conn.receive(buffer, &mut received)?;
        if received == 0 {
            return if treat_empty_as_close {
                Err(ServerError::PeerClosed)
            } else {
                Ok(())
            };
        }

        self.http.process(&buffer[..received], root);
        self.state = JobState::Write;
        Ok(())
    }

    /// Pushes response bytes: head first, then body or file.
    ///
    /// Body and file bytes never go out before the head is complete, so a
    /// partial head simply re-enters here on the next writable event.
    /// Errors mean the job must be finished.
    pub fn write(&mut self, scratch: &mut [u8]) -> ServerResult<()> {
        let response = &self.http.response;
        let conn = self.conn.as_mut().ok_or(ServerError::PeerClosed)?;

        conn.send(&response.head, &mut self.sent_head)?;
        if self.sent_head < response.head.len() {
            return Ok(());
        }

        match response.kind {
            ResponseKind::HeadOnly => {}
            ResponseKind::Text => {
                conn.send(&response.body, &mut self.sent_body)?;
            }
            ResponseKind::File => {
                if let Some(file) = &response.file {
                    conn.sendfile(&file.file, file.len, scratch, &mut self.sent_file)?;
                }
            }
        }
        Ok(())
    }

    /// True while any head, body, file, or queued TLS bytes remain.
    pub fn has_more_write(&self) -> bool {
        if self.state != JobState::Write {
            return false;
        }
        let response = &self.http.response;
        let head_remaining = response.head.len().saturating_sub(self.sent_head) > 0;
        let remaining = match response.kind {
            ResponseKind::HeadOnly => head_remaining,
            ResponseKind::Text => {
                head_remaining || response.body.len().saturating_sub(self.sent_body) > 0
            }
            ResponseKind::File => {
                head_remaining || response.file_len().saturating_sub(self.sent_file) > 0
            }
        };
        remaining || self.conn.as_ref().is_some_and(Conn::tls_pending_write)
    }

    /// Re-arms for the next request on the same connection (keep-alive).
    pub fn reset(&mut self) {
        self.http.clear();
        self.state = JobState::Read;
        self.sent_head = 0;
        self.sent_body = 0;
        self.sent_file = 0;
    }

    /// Tears down the connection and clears the slot for reuse.
    pub fn finish(&mut self, scratch: &mut [u8]) {
        if let Some(mut conn) = self.conn.take() {
            conn.close(scratch);
        }
        self.http.clear();
        self.state = JobState::Read;
        self.sent_head = 0;
        self.sent_body = 0;
        self.sent_file = 0;
        self.write_armed = false;
    }
}

/// Fixed-capacity pool of job slots.
///
/// The slot array is allocated once; `acquire` pops an index off the
/// mutexed LIFO free list (hottest slot first) and `release` pushes it
/// back. Each slot carries its own mutex: after the listener publishes a
/// job to a worker exactly one thread touches it at a time, so the
/// per-slot lock is uncontended in steady state.
#[derive(Debug)]
pub struct Manager {
    slots: Box<[Mutex<Job>]>,
    free: Mutex<Vec<usize>>,
}

impl Manager {
    /// Creates a manager with `capacity` job slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "manager capacity must be positive");
        let slots: Vec<Mutex<Job>> = (0..capacity).map(|_| Mutex::new(Job::empty())).collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new((0..capacity).rev().collect()),
        }
    }

    /// Takes a free slot index, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<usize> {
        self.free.lock().ok()?.pop()
    }

    /// Returns a slot to the pool.
    pub fn release(&self, index: usize) {
        debug_assert!(index < self.slots.len());
        match self.free.lock() {
            Ok(mut free) => {
                debug_assert!(!free.contains(&index), "slot {index} double-released");
                free.push(index);
            }
            Err(e) => error!(error = %e, "job free list poisoned"),
        }
    }

    /// Access to a slot's job. Valid for any index below capacity, whether
    /// or not it is currently acquired; callers holding a stale index see a
    /// job with no connection.
    pub fn job(&self, index: usize) -> Option<&Mutex<Job>> {
        self.slots.get(index)
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free slots remaining.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or_else(|e| {
            debug!(error = %e, "job free list poisoned");
            0
        })
    }
}
