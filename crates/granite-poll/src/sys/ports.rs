//! Solaris/illumos event-ports engine.
//!
//! Event ports are one-shot: every delivered event consumes its
//! association, so both `update_interest` and `rearm_read` re-associate the
//! descriptor unconditionally. Edge-triggered behavior is inherent in the
//! one-shot model.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{Backend, Events, PollError, PollResult};
use crate::code::{Code, Event, Token};

fn code_to_events(code: Code) -> libc::c_int {
    let mut events = 0;
    if code.contains(Code::READ) {
        events |= libc::POLLIN as libc::c_int | libc::POLLPRI as libc::c_int;
    }
    if code.contains(Code::WRITE) {
        events |= libc::POLLOUT as libc::c_int;
    }
    events
}

fn events_to_code(events: libc::c_int) -> Code {
    let mut code = Code::empty();
    if events & (libc::POLLIN as libc::c_int | libc::POLLPRI as libc::c_int) != 0 {
        code |= Code::READ;
    }
    if events & libc::POLLOUT as libc::c_int != 0 {
        code |= Code::WRITE;
    }
    if events & libc::POLLHUP as libc::c_int != 0 {
        code |= Code::CLOSE;
    }
    if events & libc::POLLERR as libc::c_int != 0 {
        code |= Code::ERROR;
    }
    code
}

/// Readiness engine over `port_create`/`port_associate`/`port_getn`.
#[derive(Debug)]
pub struct Ports {
    port: OwnedFd,
    capacity: usize,
    registered: AtomicUsize,
    items: Mutex<Vec<libc::port_event>>,
}

impl Backend for Ports {
    const NAME: &'static str = "event-ports";

    fn with_capacity(capacity: usize) -> io::Result<Self> {
        let port = unsafe { libc::port_create() };
        if port == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            port: unsafe { OwnedFd::from_raw_fd(port) },
            capacity,
            registered: AtomicUsize::new(0),
            items: Mutex::new(vec![unsafe { mem::zeroed() }; capacity.max(1)]),
        })
    }

    fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        if self.registered.load(Ordering::Relaxed) >= self.capacity {
            return Err(PollError::Capacity {
                limit: self.capacity,
            });
        }
        let ret = unsafe {
            libc::port_associate(
                self.port.as_raw_fd(),
                libc::PORT_SOURCE_FD,
                fd as libc::uintptr_t,
                code_to_events(code),
                token.0 as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(PollError::Io(io::Error::last_os_error()));
        }
        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        // Re-association replaces the previous interest.
        let ret = unsafe {
            libc::port_associate(
                self.port.as_raw_fd(),
                libc::PORT_SOURCE_FD,
                fd as libc::uintptr_t,
                code_to_events(code),
                token.0 as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(PollError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd, _code: Code) -> PollResult<()> {
        let ret = unsafe {
            libc::port_dissociate(
                self.port.as_raw_fd(),
                libc::PORT_SOURCE_FD,
                fd as libc::uintptr_t,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            // Delivered events already consumed the association.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(PollError::Io(err));
            }
        }
        self.registered.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        events.clear();
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let mut items = self.items.lock().expect("port item buffer poisoned");
        let mut nget: libc::c_uint = 1;
        let ret = unsafe {
            libc::port_getn(
                self.port.as_raw_fd(),
                items.as_mut_ptr(),
                items.len() as libc::c_uint,
                &mut nget,
                &timeout as *const libc::timespec as *mut libc::timespec,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ETIME) => return Ok(0),
                _ => return Err(err),
            }
        }

        let count = nget as usize;
        // Each delivered event consumed its association.
        if count > 0 {
            self.registered.fetch_sub(count, Ordering::Relaxed);
        }
        for item in items.iter().take(count) {
            events.push(Event {
                code: events_to_code(item.portev_events as libc::c_int),
                token: Token(item.portev_user as usize),
            });
        }
        Ok(count)
    }

    fn update_interest(
        &self,
        fd: RawFd,
        token: Token,
        want_write: bool,
        _had_write: bool,
    ) -> PollResult<()> {
        let code = if want_write {
            Code::READ | Code::WRITE | Code::EDGE
        } else {
            Code::READ | Code::EDGE
        };
        self.add(fd, code, token)
    }

    fn rearm_read(&self, fd: RawFd, token: Token) -> PollResult<()> {
        self.add(fd, Code::READ | Code::EDGE, token)
    }

    fn forget(&self, fd: RawFd, _had_write: bool) -> PollResult<()> {
        self.remove(fd, Code::READ)
    }
}
