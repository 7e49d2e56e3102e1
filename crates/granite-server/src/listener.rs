//! Listener: accepts connections and dispatches them to workers.
//!
//! One poller watches exactly one descriptor, the listen socket. Every
//! readable edge drains the accept queue completely. Each accepted socket
//! either becomes a pooled job assigned to a worker (round-robin), or is
//! shed-closed when no resources are left, which keeps the listen queue
//! from filling under overload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use granite_poll::{Backend, Code, Event, EventHandler, Poller, Registry, Token};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::job::Manager;
use crate::transport::Endpoint;
use crate::worker::WorkerHandle;

/// Token for the listen socket on the listener's own poller.
const SERVER_TOKEN: Token = Token(usize::MAX);

/// Accepting side of the server: a poller plus one endpoint.
pub struct Listener {
    poller: Poller,
    handler: Option<ListenerHandler>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Wraps a bound endpoint with its accept loop.
    ///
    /// `workers` is the assignment ring; `buffer_size` sizes the scratch
    /// buffer used to close shed connections.
    pub fn new(
        name: &str,
        endpoint: Endpoint,
        manager: Arc<Manager>,
        workers: Vec<WorkerHandle>,
        buffer_size: usize,
    ) -> ServerResult<Self> {
        if workers.is_empty() {
            return Err(ServerError::Config("listener needs at least one worker".into()));
        }
        // The poller only ever watches the one listen socket; capacity 2
        // leaves slack for the re-arm window on one-shot backends.
        let poller = Poller::with_capacity(format!("listener-{name}"), 2)?;
        let local_addr = endpoint.local_addr();
        let handler = ListenerHandler {
            endpoint,
            manager,
            workers,
            cursor: 0,
            scratch: vec![0u8; buffer_size.min(64 * 1024)],
        };
        Ok(Self {
            poller,
            handler: Some(handler),
            local_addr,
        })
    }

    /// The endpoint's actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attaches the process-wide shutdown flag.
    pub fn attach_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.poller.attach_shutdown(flag);
    }

    /// Registers the listen socket and spawns the accept thread.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&mut self) -> ServerResult<()> {
        let handler = self.handler.take().expect("listener already started");
        self.poller.registry().add(
            handler.endpoint.raw_fd(),
            Code::READ | Code::EDGE,
            SERVER_TOKEN,
        )?;
        info!(
            addr = %self.local_addr,
            tls = handler.endpoint.is_tls(),
            "listening"
        );
        self.poller.run(handler)?;
        Ok(())
    }

    /// Requests cooperative stop; the listen socket closes with the
    /// handler when the thread exits.
    pub fn stop(&self) {
        self.poller.stop();
    }

    /// Waits for the accept thread to exit.
    pub fn join(&mut self) {
        self.poller.join();
    }
}

struct ListenerHandler {
    endpoint: Endpoint,
    manager: Arc<Manager>,
    workers: Vec<WorkerHandle>,
    /// Round-robin cursor over `workers`; advances on every assignment
    /// attempt, successful or not.
    cursor: usize,
    scratch: Vec<u8>,
}

enum AcceptOutcome {
    /// A connection was handled (assigned or shed); keep draining.
    Progress,
    /// The accept queue is empty.
    Drained,
}

impl ListenerHandler {
    /// Accepts one connection and places it, or sheds it.
    fn accept_one(&mut self) -> ServerResult<AcceptOutcome> {
        let Some(slot) = self.manager.acquire() else {
            return self.shed_one();
        };

        let conn = match self.endpoint.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => {
                self.manager.release(slot);
                return Ok(AcceptOutcome::Drained);
            }
            Err(e) => {
                self.manager.release(slot);
                return Err(e);
            }
        };

        let mut conn = conn;
        if let Err(e) = conn.setup(self.endpoint.options()) {
            debug!(peer = %conn.peer(), error = %e, "connection setup failed");
            conn.close(&mut self.scratch);
            self.manager.release(slot);
            return Ok(AcceptOutcome::Progress);
        }

        let fd = conn.raw_fd();
        let peer = conn.peer();

        // Publish the connection into the slot before registering it: the
        // first readiness event may fire on the worker immediately.
        match self.manager.job(slot) {
            Some(job_slot) => match job_slot.lock() {
                Ok(mut job) => job.begin(conn),
                Err(e) => {
                    warn!(slot, error = %e, "job slot poisoned");
                    self.manager.release(slot);
                    return Ok(AcceptOutcome::Progress);
                }
            },
            None => {
                self.manager.release(slot);
                return Ok(AcceptOutcome::Progress);
            }
        }

        // Round-robin with one full lap: a saturated worker is skipped,
        // and when every worker is saturated the connection is shed.
        let mut assigned = false;
        for _ in 0..self.workers.len() {
            let worker = &self.workers[self.cursor];
            self.cursor = (self.cursor + 1) % self.workers.len();
            match worker.assign(fd, Token(slot)) {
                Ok(()) => {
                    assigned = true;
                    break;
                }
                Err(e) => debug!(slot, error = %e, "worker assignment failed"),
            }
        }

        if !assigned {
            warn!(peer = %peer, "all workers saturated, shedding connection");
            if let Some(job_slot) = self.manager.job(slot) {
                if let Ok(mut job) = job_slot.lock() {
                    job.finish(&mut self.scratch);
                }
            }
            self.manager.release(slot);
        }

        Ok(AcceptOutcome::Progress)
    }

    /// Accepts and immediately closes one connection (pool exhausted).
    fn shed_one(&mut self) -> ServerResult<AcceptOutcome> {
        match self.endpoint.accept() {
            Ok(Some(mut conn)) => {
                debug!(peer = %conn.peer(), "job pool exhausted, shedding connection");
                conn.close(&mut self.scratch);
                Ok(AcceptOutcome::Progress)
            }
            Ok(None) => Ok(AcceptOutcome::Drained),
            Err(e) => Err(e),
        }
    }
}

impl<B: Backend> EventHandler<B> for ListenerHandler {
    fn on_event(&mut self, registry: &Registry<B>, event: Event) {
        if !event.code.contains(Code::READ) {
            debug!(code = ?event.code, "listener ignoring non-read event");
            return;
        }

        // Edge-triggered: drain the whole accept queue before returning.
        loop {
            match self.accept_one() {
                Ok(AcceptOutcome::Progress) => continue,
                Ok(AcceptOutcome::Drained) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }

        // One-shot backends consumed the listen socket's association.
        if let Err(e) = registry.rearm_read(self.endpoint.raw_fd(), SERVER_TOKEN) {
            warn!(error = %e, "listen socket re-arm failed");
        }
    }

    fn on_stop(&mut self, _registry: &Registry<B>) {
        info!(addr = %self.endpoint.local_addr(), "listener stopped");
        // The endpoint (and with it the listen socket) drops with the
        // handler when the poller thread exits.
    }
}
