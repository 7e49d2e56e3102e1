//! Linux epoll engine.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{Backend, Events, PollError, PollResult};
use crate::code::{Code, Event, Token};

fn code_to_events(code: Code) -> u32 {
    let mut events = 0u32;
    if code.contains(Code::READ) {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if code.contains(Code::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    if code.contains(Code::EDGE) {
        events |= libc::EPOLLET as u32;
    }
    events
}

fn events_to_code(events: u32) -> Code {
    let mut code = Code::empty();
    if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
        code |= Code::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        code |= Code::WRITE;
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        code |= Code::CLOSE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        code |= Code::ERROR;
    }
    code
}

/// Readiness engine over `epoll_create1`/`epoll_ctl`/`epoll_wait`.
///
/// `EDGE` maps to `EPOLLET` natively; registrations are persistent, so no
/// re-arming is ever needed.
#[derive(Debug)]
pub struct Epoll {
    epfd: OwnedFd,
    capacity: usize,
    registered: AtomicUsize,
    /// Raw event buffer, reused across waits. Only the poller thread waits,
    /// so the lock is uncontended.
    items: Mutex<Vec<libc::epoll_event>>,
}

impl Epoll {
    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> PollResult<()> {
        let ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut _);
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ptr) };
        if ret == -1 {
            return Err(PollError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Backend for Epoll {
    const NAME: &'static str = "epoll";

    fn with_capacity(capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            capacity,
            registered: AtomicUsize::new(0),
            items: Mutex::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                capacity.max(1)
            ]),
        })
    }

    fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        if self.registered.load(Ordering::Relaxed) >= self.capacity {
            return Err(PollError::Capacity {
                limit: self.capacity,
            });
        }
        let mut event = libc::epoll_event {
            events: code_to_events(code),
            u64: token.0 as u64,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut event))?;
        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        let mut event = libc::epoll_event {
            events: code_to_events(code),
            u64: token.0 as u64,
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(&mut event))
    }

    fn remove(&self, fd: RawFd, _code: Code) -> PollResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)?;
        self.registered.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        events.clear();
        let mut items = self.items.lock().expect("epoll item buffer poisoned");
        let count = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                items.as_mut_ptr(),
                items.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
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
            events.push(Event {
                code: events_to_code(item.events),
                token: Token(item.u64 as usize),
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
        if want_write == had_write {
            return Ok(());
        }
        let code = if want_write {
            Code::READ | Code::WRITE | Code::EDGE
        } else {
            Code::READ | Code::EDGE
        };
        self.modify(fd, code, token)
    }

    fn forget(&self, fd: RawFd, _had_write: bool) -> PollResult<()> {
        self.remove(fd, Code::READ)
    }
}
