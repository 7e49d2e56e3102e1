//! Worker: one poller thread serving many jobs.
//!
//! The listener registers each accepted job's socket here for
//! READ|EDGE; from then on every readiness event for that socket lands in
//! this worker's callback until the job finishes. The edge-triggered
//! contract is honored by the transport (receive and send both drain to
//! would-block), and the write-interest invariant is reconciled after
//! every event through the backend's `update_interest` policy.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use granite_poll::{Backend, Code, Event, EventHandler, Poller, Registry, Token};
use tracing::{debug, warn};

use crate::error::ServerResult;
use crate::job::{Job, JobState, Manager};
use crate::transport::Conn;

/// Registration handle for assigning jobs to a worker from other threads.
#[derive(Clone)]
pub struct WorkerHandle {
    registry: Registry,
}

impl WorkerHandle {
    /// Registers a job's socket for read interest, publishing the job to
    /// the worker. Fails when the worker's poller is at capacity.
    pub fn assign(&self, fd: RawFd, token: Token) -> ServerResult<()> {
        self.registry.add(fd, Code::READ | Code::EDGE, token)?;
        Ok(())
    }
}

/// A worker thread: owns a poller and a scratch transfer buffer.
pub struct Worker {
    poller: Poller,
    handler: Option<WorkerHandler>,
}

impl Worker {
    /// Creates the worker's poller and event handler.
    pub fn new(
        index: usize,
        capacity: usize,
        manager: Arc<Manager>,
        root: Arc<PathBuf>,
        buffer_size: usize,
    ) -> ServerResult<Self> {
        let poller = Poller::with_capacity(format!("worker-{index}"), capacity)?;
        let handler = WorkerHandler {
            manager,
            root,
            buffer: vec![0u8; buffer_size],
        };
        Ok(Self {
            poller,
            handler: Some(handler),
        })
    }

    /// Attaches the process-wide shutdown flag.
    pub fn attach_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.poller.attach_shutdown(flag);
    }

    /// Returns the handle listeners use to assign jobs.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            registry: self.poller.registry(),
        }
    }

    /// Spawns the worker thread.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&mut self) -> ServerResult<()> {
        let handler = self.handler.take().expect("worker already started");
        self.poller.run(handler)?;
        Ok(())
    }

    /// Requests cooperative stop.
    pub fn stop(&self) {
        self.poller.stop();
    }

    /// Waits for the worker thread to exit.
    pub fn join(&mut self) {
        self.poller.join();
    }
}

struct WorkerHandler {
    manager: Arc<Manager>,
    root: Arc<PathBuf>,
    buffer: Vec<u8>,
}

impl WorkerHandler {
    /// Deregisters, closes, and returns the job to the pool.
    fn finish_job<B: Backend>(&mut self, registry: &Registry<B>, job: &mut Job, slot: usize) {
        if let Some(conn) = &job.conn {
            if let Err(e) = registry.forget(conn.raw_fd(), job.write_armed) {
                debug!(slot, error = %e, "deregister failed");
            }
        }
        job.finish(&mut self.buffer);
        self.manager.release(slot);
    }

    /// Reconciles poller write interest with the job's remaining output.
    fn adjust_interest<B: Backend>(
        registry: &Registry<B>,
        job: &mut Job,
        fd: RawFd,
        token: Token,
    ) {
        let want_write = job.has_more_write();
        match registry.update_interest(fd, token, want_write, job.write_armed) {
            Ok(()) => job.write_armed = want_write,
            Err(e) => warn!(error = %e, "interest update failed"),
        }
    }

    /// Runs the write half and decides what happens to the job next.
    fn drive_write<B: Backend>(&mut self, registry: &Registry<B>, job: &mut Job, slot: usize, token: Token) {
        if job.write(&mut self.buffer).is_err() {
            self.finish_job(registry, job, slot);
            return;
        }

        if job.has_more_write() {
            if let Some(fd) = job.conn.as_ref().map(Conn::raw_fd) {
                Self::adjust_interest(registry, job, fd, token);
            }
            return;
        }

        if job.http.should_close {
            self.finish_job(registry, job, slot);
            return;
        }

        // Response fully sent on a keep-alive connection: back to reading.
        job.reset();
        if let Some(fd) = job.conn.as_ref().map(Conn::raw_fd) {
            Self::adjust_interest(registry, job, fd, token);
            if !job.write_armed {
                // One-shot backends need the read side re-armed too.
                if let Err(e) = registry.rearm_read(fd, token) {
                    debug!(error = %e, "read re-arm failed");
                }
            }
        }
    }
}

impl<B: Backend> EventHandler<B> for WorkerHandler {
    fn on_event(&mut self, registry: &Registry<B>, event: Event) {
        let slot = event.token.0;
        // Hold the manager through a local so the guard below does not pin
        // a borrow of `self` across the &mut self calls.
        let manager = Arc::clone(&self.manager);
        let Some(job_slot) = manager.job(slot) else {
            warn!(slot, "event for unknown job slot");
            return;
        };
        let Ok(mut job) = job_slot.lock() else {
            warn!(slot, "job slot poisoned");
            return;
        };
        // A stale event can race the slot being released and re-pooled;
        // a pooled job has no connection and nothing to do.
        if job.conn.is_none() {
            return;
        }

        if event.code.contains(Code::CLOSE) {
            self.finish_job(registry, &mut job, slot);
            return;
        }

        if event.code.contains(Code::ERROR) {
            if let Some(conn) = &job.conn {
                let errno = conn.take_error();
                debug!(slot, errno, peer = %conn.peer(), "connection error");
            }
            self.finish_job(registry, &mut job, slot);
            return;
        }

        if event.code.contains(Code::WRITE) {
            self.drive_write(registry, &mut job, slot, event.token);
            return;
        }

        if event.code.contains(Code::READ) {
            if job.read(&mut self.buffer, &self.root).is_err() {
                self.finish_job(registry, &mut job, slot);
                return;
            }

            if job.state == JobState::Write {
                // Piggyback: most responses fit the socket buffer, so try
                // to push them before going back to the poller.
                self.drive_write(registry, &mut job, slot, event.token);
            } else if let Some(conn) = &job.conn {
                // Still waiting for a request (or a handshake round); the
                // one-shot backends need the association restored.
                if let Err(e) = registry.rearm_read(conn.raw_fd(), event.token) {
                    debug!(error = %e, "read re-arm failed");
                }
            }
            return;
        }

        debug!(slot, code = ?event.code, "unhandled poll code");
    }
}
