//! BSD/macOS kqueue engine.
//!
//! READ and WRITE interest are separate kqueue filters, so a registration
//! asking for both consumes two entries; the constructor doubles the
//! configured ceiling to compensate. `EDGE` maps to `EV_CLEAR`.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{Backend, Events, PollError, PollResult};
use crate::code::{Code, Event, Token};

fn change(fd: RawFd, filter: i16, flags: u16, token: usize) -> libc::kevent {
    // Field types differ slightly across the BSDs; zero-init and assign.
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token as *mut libc::c_void;
    ev
}

fn flags_to_code(flags: u16) -> Code {
    let mut code = Code::empty();
    if flags & libc::EV_EOF as u16 != 0 {
        code |= Code::CLOSE;
    }
    if flags & libc::EV_ERROR as u16 != 0 {
        code |= Code::ERROR;
    }
    code
}

/// Readiness engine over `kqueue`/`kevent`.
#[derive(Debug)]
pub struct Kqueue {
    kq: OwnedFd,
    /// Doubled relative to the requested ceiling: READ and WRITE filters
    /// count separately.
    capacity: usize,
    registered: AtomicUsize,
    items: Mutex<Vec<libc::kevent>>,
}

impl Kqueue {
    fn submit(&self, changes: &[libc::kevent]) -> PollResult<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret == -1 {
            return Err(PollError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn changes_for(fd: RawFd, code: Code, token: Token, flags: u16) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(2);
        if code.contains(Code::READ) {
            changes.push(change(fd, libc::EVFILT_READ as i16, flags, token.0));
        }
        if code.contains(Code::WRITE) {
            changes.push(change(fd, libc::EVFILT_WRITE as i16, flags, token.0));
        }
        changes
    }
}

impl Backend for Kqueue {
    const NAME: &'static str = "kqueue";

    fn with_capacity(capacity: usize) -> io::Result<Self> {
        let capacity = capacity * 2;
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
            capacity,
            registered: AtomicUsize::new(0),
            items: Mutex::new(vec![unsafe { mem::zeroed() }; capacity.max(1)]),
        })
    }

    fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        let mut flags = libc::EV_ADD as u16;
        if code.contains(Code::EDGE) {
            flags |= libc::EV_CLEAR as u16;
        }
        let changes = Self::changes_for(fd, code, token, flags);
        if changes.is_empty() {
            return Err(PollError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "registration without READ or WRITE interest",
            )));
        }
        if self.registered.load(Ordering::Relaxed) + changes.len() > self.capacity {
            return Err(PollError::Capacity {
                limit: self.capacity,
            });
        }
        self.submit(&changes)?;
        self.registered.fetch_add(changes.len(), Ordering::Relaxed);
        Ok(())
    }

    fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        let mut flags = libc::EV_ADD as u16;
        if code.contains(Code::EDGE) {
            flags |= libc::EV_CLEAR as u16;
        }
        let changes = Self::changes_for(fd, code, token, flags);
        if changes.is_empty() {
            return Err(PollError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "registration without READ or WRITE interest",
            )));
        }
        self.submit(&changes)
    }

    fn remove(&self, fd: RawFd, code: Code) -> PollResult<()> {
        let mut changes = Vec::with_capacity(2);
        if code.contains(Code::READ) {
            changes.push(change(fd, libc::EVFILT_READ as i16, libc::EV_DELETE as u16, 0));
        }
        if code.contains(Code::WRITE) {
            changes.push(change(fd, libc::EVFILT_WRITE as i16, libc::EV_DELETE as u16, 0));
        }
        if changes.is_empty() {
            return Err(PollError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "removal without READ or WRITE filter",
            )));
        }
        self.submit(&changes)?;
        self.registered.fetch_sub(changes.len(), Ordering::Relaxed);
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        events.clear();
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let mut items = self.items.lock().expect("kqueue item buffer poisoned");
        let count = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                items.as_mut_ptr(),
                items.len() as _,
                &timeout,
            )
        };
        if count == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for item in items.iter().take(count as usize) {
            let mut code = if item.filter == libc::EVFILT_WRITE as _ {
                Code::WRITE
            } else {
                Code::READ
            };
            code |= flags_to_code(item.flags as u16);
            events.push(Event {
                code,
                token: Token(item.udata as usize),
            });
        }
        Ok(count as usize)
    }

    fn update_interest(
        &self,
        fd: RawFd,
        token: Token,
        want_write: bool,
        had_write: bool,
    ) -> PollResult<()> {
        if want_write && !had_write {
            return self.add(fd, Code::WRITE | Code::EDGE, token);
        }
        if !want_write && had_write {
            return self.remove(fd, Code::WRITE);
        }
        Ok(())
    }

    fn forget(&self, fd: RawFd, had_write: bool) -> PollResult<()> {
        self.remove(fd, Code::READ)?;
        if had_write {
            self.remove(fd, Code::WRITE)?;
        }
        Ok(())
    }
}
