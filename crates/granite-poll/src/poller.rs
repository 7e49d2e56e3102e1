//! Poller front-end: one readiness engine, one worker thread.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

use crate::backend::{Backend, Events, PollResult};
use crate::code::{Code, Event, Token};
use crate::sys;

/// How long a single wait blocks before re-checking the stop flags.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cheaply cloneable handle for registering interest with a poller.
///
/// Registrations are safe from any thread; event delivery always happens on
/// the poller's own thread.
#[derive(Debug)]
pub struct Registry<B: Backend = sys::Platform> {
    backend: Arc<B>,
}

impl<B: Backend> Clone for Registry<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> Registry<B> {
    /// Registers readiness interest for `fd`. See [`Backend::add`].
    pub fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        self.backend.add(fd, code, token)
    }

    /// Replaces the registered interest for `fd`.
    pub fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        self.backend.modify(fd, code, token)
    }

    /// Deregisters `code` interest for `fd`.
    pub fn remove(&self, fd: RawFd, code: Code) -> PollResult<()> {
        self.backend.remove(fd, code)
    }

    /// Reconciles write interest after an event callback.
    pub fn update_interest(
        &self,
        fd: RawFd,
        token: Token,
        want_write: bool,
        had_write: bool,
    ) -> PollResult<()> {
        self.backend.update_interest(fd, token, want_write, had_write)
    }

    /// Re-arms a read-only registration on one-shot engines.
    pub fn rearm_read(&self, fd: RawFd, token: Token) -> PollResult<()> {
        self.backend.rearm_read(fd, token)
    }

    /// Removes every filter held for `fd`.
    pub fn forget(&self, fd: RawFd, had_write: bool) -> PollResult<()> {
        self.backend.forget(fd, had_write)
    }
}

/// Receives readiness events on the poller thread.
///
/// `on_event` runs once per delivered record and may register or deregister
/// descriptors, but must not block: every job sharing the poller stalls
/// while it runs. When the registration is edge-triggered the handler must
/// drain the descriptor to would-block before returning.
pub trait EventHandler<B: Backend = sys::Platform>: Send + 'static {
    /// One readiness record.
    fn on_event(&mut self, registry: &Registry<B>, event: Event);

    /// Runs exactly once when the poller thread exits, before backend
    /// resources are released.
    fn on_stop(&mut self, registry: &Registry<B>) {
        let _ = registry;
    }
}

/// An edge/level-triggered readiness notifier with its own worker thread.
///
/// The generic parameter selects the engine; the default is the platform's
/// native one. Cancellation is cooperative: [`stop`](Poller::stop) raises a
/// flag the loop checks before each wait, so shutdown latency is bounded by
/// the wait timeout (~1 s).
#[derive(Debug)]
pub struct Poller<B: Backend = sys::Platform> {
    registry: Registry<B>,
    capacity: usize,
    name: String,
    stop: Arc<AtomicBool>,
    /// Optional process-wide shutdown flag, checked alongside `stop`.
    shutdown: Option<Arc<AtomicBool>>,
    thread: Option<JoinHandle<()>>,
}

impl<B: Backend> Poller<B> {
    /// Creates a poller able to watch up to `capacity` descriptors.
    ///
    /// `name` labels the worker thread (`granite-poll/<name>`).
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> io::Result<Self> {
        let backend = B::with_capacity(capacity)?;
        Ok(Self {
            registry: Registry {
                backend: Arc::new(backend),
            },
            capacity,
            name: name.into(),
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            thread: None,
        })
    }

    /// Returns a registration handle usable from any thread.
    pub fn registry(&self) -> Registry<B> {
        self.registry.clone()
    }

    /// Attaches a process-wide shutdown flag observed by the event loop.
    pub fn attach_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    /// Spawns the worker thread and returns immediately.
    ///
    /// # Panics
    ///
    /// Panics if the poller is already running.
    pub fn run<H: EventHandler<B>>(&mut self, mut handler: H) -> io::Result<()> {
        assert!(self.thread.is_none(), "poller already running");

        let registry = self.registry.clone();
        let stop = Arc::clone(&self.stop);
        let shutdown = self.shutdown.clone();
        let capacity = self.capacity;

        let thread = thread::Builder::new()
            .name(format!("granite-poll/{}", self.name))
            .spawn(move || {
                let mut events = Events::with_capacity(capacity);
                loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Some(flag) = &shutdown {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                    }

                    match registry.backend.wait(&mut events, WAIT_TIMEOUT) {
                        Ok(_) => {}
                        Err(e) => {
                            error!(backend = B::NAME, error = %e, "poll wait failed");
                            break;
                        }
                    }
                    for event in events.iter() {
                        handler.on_event(&registry, *event);
                    }
                }
                handler.on_stop(&registry);
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Requests cooperative cancellation of the worker thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Blocks until the worker thread exits. No-op if it never started.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(backend = B::NAME, "poller thread panicked");
            }
        }
    }

    /// Returns true while the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl<B: Backend> Drop for Poller<B> {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::poll::Poll as GenericPoll;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    struct ChannelHandler {
        tx: mpsc::Sender<Event>,
        stopped_tx: mpsc::Sender<()>,
    }

    impl<B: Backend> EventHandler<B> for ChannelHandler {
        fn on_event(&mut self, _registry: &Registry<B>, event: Event) {
            let _ = self.tx.send(event);
        }

        fn on_stop(&mut self, _registry: &Registry<B>) {
            let _ = self.stopped_tx.send(());
        }
    }

    fn readable_event_reaches_handler<B: Backend>() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let mut poller: Poller<B> = Poller::with_capacity("test", 4).unwrap();
        poller
            .registry()
            .add(reader.as_raw_fd(), Code::READ | Code::EDGE, Token(7))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let (stopped_tx, stopped_rx) = mpsc::channel();
        poller.run(ChannelHandler { tx, stopped_tx }).unwrap();

        writer.write_all(b"ping").unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.token, Token(7));
        assert!(event.code.contains(Code::READ));

        poller.stop();
        poller.join();
        stopped_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("on_stop must run exactly once");
    }

    #[test]
    fn platform_backend_delivers_events() {
        readable_event_reaches_handler::<sys::Platform>();
    }

    #[test]
    fn generic_poll_backend_delivers_events() {
        readable_event_reaches_handler::<GenericPoll>();
    }

    #[test]
    fn capacity_ceiling_rejects_add() {
        let (_a, sock_a) = UnixStream::pair().unwrap();
        let (_b, sock_b) = UnixStream::pair().unwrap();

        let poller: Poller<sys::Platform> = Poller::with_capacity("cap", 1).unwrap();
        let registry = poller.registry();
        registry
            .add(sock_a.as_raw_fd(), Code::READ | Code::EDGE, Token(0))
            .unwrap();
        assert!(matches!(
            registry.add(sock_b.as_raw_fd(), Code::READ | Code::EDGE, Token(1)),
            Err(crate::PollError::Capacity { .. })
        ));
    }

    #[test]
    fn update_interest_arms_and_disarms_write() {
        let (_peer, sock) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let fd = sock.as_raw_fd();

        let mut poller: Poller<sys::Platform> = Poller::with_capacity("write", 4).unwrap();
        let registry = poller.registry();
        registry.add(fd, Code::READ | Code::EDGE, Token(3)).unwrap();

        let (tx, rx) = mpsc::channel();
        let (stopped_tx, _stopped_rx) = mpsc::channel();
        poller.run(ChannelHandler { tx, stopped_tx }).unwrap();

        // Arming write interest on an idle socket fires a writable event.
        registry.update_interest(fd, Token(3), true, false).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.code.contains(Code::WRITE));
        assert_eq!(event.token, Token(3));

        // Disarming must stop the writable stream; allow the in-flight
        // edge-triggered burst to settle first.
        registry.update_interest(fd, Token(3), false, true).unwrap();
        while rx.recv_timeout(Duration::from_millis(200)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn stop_without_run_is_harmless() {
        let mut poller: Poller<GenericPoll> = Poller::with_capacity("idle", 2).unwrap();
        poller.stop();
        poller.join();
        assert!(!poller.is_running());
    }

    #[test]
    fn drop_joins_the_thread() {
        let (tx, _rx) = mpsc::channel();
        let (stopped_tx, stopped_rx) = mpsc::channel();
        {
            let mut poller: Poller<GenericPoll> = Poller::with_capacity("drop", 2).unwrap();
            poller.run(ChannelHandler { tx, stopped_tx }).unwrap();
            poller.stop();
        }
        // Drop must have joined; on_stop fired.
        stopped_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
