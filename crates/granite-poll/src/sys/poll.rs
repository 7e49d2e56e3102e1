//! Generic poll(2) engine.
//!
//! Works on every unix and carries no native edge-triggered mode; the
//! drain-to-would-block discipline of the callers makes level-triggered
//! re-delivery harmless. Descriptors live in a dense `pollfd` table plus a
//! [`ByteMap`] from descriptor bytes to table slot, both guarded by one
//! poller-local mutex. Removal swap-fills from the tail to keep the table
//! dense.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{Backend, Events, PollError, PollResult};
use crate::byte_map::ByteMap;
use crate::code::{Code, Event, Token};

fn code_to_events(code: Code) -> libc::c_short {
    let mut events = 0;
    if code.contains(Code::READ) {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if code.contains(Code::WRITE) {
        events |= libc::POLLOUT;
    }
    events
}

fn events_to_code(events: libc::c_short) -> Code {
    let mut code = Code::empty();
    if events & (libc::POLLIN | libc::POLLPRI) != 0 {
        code |= Code::READ;
    }
    if events & libc::POLLOUT != 0 {
        code |= Code::WRITE;
    }
    if events & libc::POLLHUP != 0 {
        code |= Code::CLOSE;
    }
    if events & libc::POLLERR != 0 {
        code |= Code::ERROR;
    }
    code
}

#[derive(Debug, Clone, Copy)]
struct WatchSlot {
    index: usize,
    token: Token,
}

#[derive(Debug)]
struct State {
    items: Vec<libc::pollfd>,
    map: ByteMap<WatchSlot>,
    /// Snapshot buffer handed to poll(2) outside the lock.
    snapshot: Vec<libc::pollfd>,
}

/// Readiness engine over plain `poll(2)`.
#[derive(Debug)]
pub struct Poll {
    capacity: usize,
    state: Mutex<State>,
}

impl Backend for Poll {
    const NAME: &'static str = "poll";

    fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            capacity,
            state: Mutex::new(State {
                items: Vec::with_capacity(capacity),
                map: ByteMap::with_capacity(capacity.max(1)),
                snapshot: Vec::with_capacity(capacity),
            }),
        })
    }

    fn add(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        let mut state = self.state.lock().expect("poll state poisoned");
        if state.items.len() >= self.capacity {
            return Err(PollError::Capacity {
                limit: self.capacity,
            });
        }
        let index = state.items.len();
        state.items.push(libc::pollfd {
            fd,
            events: code_to_events(code),
            revents: 0,
        });
        if state
            .map
            .insert(&fd.to_ne_bytes(), WatchSlot { index, token })
            .is_err()
        {
            state.items.pop();
            return Err(PollError::Capacity {
                limit: self.capacity,
            });
        }
        Ok(())
    }

    fn modify(&self, fd: RawFd, code: Code, token: Token) -> PollResult<()> {
        let mut state = self.state.lock().expect("poll state poisoned");
        let slot = match state.map.get_mut(&fd.to_ne_bytes()) {
            Some(slot) => {
                slot.token = token;
                *slot
            }
            None => return Err(PollError::NotRegistered(fd)),
        };
        state.items[slot.index].events = code_to_events(code);
        Ok(())
    }

    fn remove(&self, fd: RawFd, _code: Code) -> PollResult<()> {
        let mut state = self.state.lock().expect("poll state poisoned");
        let slot = state
            .map
            .remove(&fd.to_ne_bytes())
            .ok_or(PollError::NotRegistered(fd))?;

        // Swap the tail entry into the vacated index to keep the table dense.
        let last = state.items.len() - 1;
        state.items.swap_remove(slot.index);
        if slot.index != last {
            let moved_fd = state.items[slot.index].fd;
            if let Some(moved) = state.map.get_mut(&moved_fd.to_ne_bytes()) {
                moved.index = slot.index;
            }
        }
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        events.clear();

        // Snapshot the table so poll(2) runs without holding the lock.
        let mut snapshot = {
            let mut state = self.state.lock().expect("poll state poisoned");
            let mut snapshot = std::mem::take(&mut state.snapshot);
            snapshot.clear();
            snapshot.extend_from_slice(&state.items);
            snapshot
        };

        let count = unsafe {
            libc::poll(
                snapshot.as_mut_ptr(),
                snapshot.len() as libc::nfds_t,
                timeout.as_millis() as libc::c_int,
            )
        };
        if count == -1 {
            let err = io::Error::last_os_error();
            let mut state = self.state.lock().expect("poll state poisoned");
            state.snapshot = snapshot;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut delivered = 0;
        {
            let mut state = self.state.lock().expect("poll state poisoned");
            for item in snapshot.iter().filter(|i| i.revents != 0) {
                // The descriptor may have been removed while poll slept.
                let Some(slot) = state.map.get(&item.fd.to_ne_bytes()) else {
                    continue;
                };
                events.push(Event {
                    code: events_to_code(item.revents),
                    token: slot.token,
                });
                delivered += 1;
            }
            state.snapshot = snapshot;
        }
        Ok(delivered)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_modify_remove_bookkeeping() {
        let poll = Poll::with_capacity(4).unwrap();
        poll.add(10, Code::READ | Code::EDGE, Token(1)).unwrap();
        poll.add(11, Code::READ | Code::EDGE, Token(2)).unwrap();
        poll.modify(10, Code::READ | Code::WRITE | Code::EDGE, Token(1))
            .unwrap();

        poll.remove(10, Code::READ).unwrap();
        // The swapped tail entry must still be addressable.
        poll.modify(11, Code::READ | Code::EDGE, Token(2)).unwrap();
        assert!(matches!(
            poll.remove(10, Code::READ),
            Err(PollError::NotRegistered(10))
        ));
    }

    #[test]
    fn capacity_ceiling() {
        let poll = Poll::with_capacity(2).unwrap();
        poll.add(1, Code::READ, Token(1)).unwrap();
        poll.add(2, Code::READ, Token(2)).unwrap();
        assert!(matches!(
            poll.add(3, Code::READ, Token(3)),
            Err(PollError::Capacity { limit: 2 })
        ));
        // Removing frees a slot for a new registration.
        poll.remove(1, Code::READ).unwrap();
        poll.add(3, Code::READ, Token(3)).unwrap();
    }

    #[test]
    fn modify_unknown_fd_fails() {
        let poll = Poll::with_capacity(2).unwrap();
        assert!(matches!(
            poll.modify(42, Code::READ, Token(0)),
            Err(PollError::NotRegistered(42))
        ));
    }

    #[test]
    fn update_interest_noop_when_unchanged() {
        let poll = Poll::with_capacity(2).unwrap();
        poll.add(7, Code::READ | Code::EDGE, Token(0)).unwrap();
        // No transition: must not fail even though fd 7 is fake, because
        // nothing is submitted to the kernel.
        poll.update_interest(7, Token(0), false, false).unwrap();
        poll.update_interest(7, Token(0), true, false).unwrap();
        poll.update_interest(7, Token(0), true, true).unwrap();
    }
}
