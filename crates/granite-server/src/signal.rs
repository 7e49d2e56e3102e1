//! Signal wiring.
//!
//! The handler does exactly one async-signal-safe thing: store into an
//! atomic. The supervising thread polls [`shutdown_requested`] and drives
//! the orderly teardown from normal code. `SIGPIPE` is ignored so a peer
//! resetting mid-send surfaces as `EPIPE` from the write instead of
//! killing the process.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

/// Installs the `SIGINT` handler and ignores `SIGPIPE`.
pub fn install() -> io::Result<()> {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }

        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// True once `SIGINT` was delivered.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_raise() {
        install().unwrap();
        assert!(!shutdown_requested());
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(shutdown_requested());
    }
}
