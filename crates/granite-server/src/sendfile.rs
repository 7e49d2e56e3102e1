//! File-to-socket transmission variants.
//!
//! Three paths, selected at runtime by the transport: the kernel
//! `sendfile(2)` for plaintext sockets on platforms that have one, a
//! buffered `lseek → read → send` loop everywhere else, and a buffered TLS
//! variant that feeds the file through the rustls session. All paths
//! resume from `*sent` and stop at would-block, so a partial transmission
//! re-enters cleanly on the next writable event.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use rustls::ServerConnection;

use crate::error::{ServerError, ServerResult};
use crate::tls;

/// Kernel-offloaded transmission. Returns `Ok(false)` when the platform
/// has no usable socket-to-file sendfile, so the caller falls back to the
/// buffered path.
#[cfg(target_os = "linux")]
pub fn kernel(socket: RawFd, file: &File, len: u64, sent: &mut u64) -> io::Result<bool> {
    while *sent < len {
        let mut offset = *sent as libc::off_t;
        let remaining = (len - *sent) as usize;
        let n = unsafe { libc::sendfile(socket, file.as_raw_fd(), &mut offset, remaining) };
        if n > 0 {
            *sent = offset as u64;
            continue;
        }
        if n == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => break,
            // EINVAL/ENOSYS: descriptor kind not supported; use the
            // buffered path instead.
            Some(libc::EINVAL) | Some(libc::ENOSYS) if *sent == 0 => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err),
        }
    }
    Ok(true)
}

/// Kernel-offloaded transmission (FreeBSD signature).
#[cfg(target_os = "freebsd")]
pub fn kernel(socket: RawFd, file: &File, len: u64, sent: &mut u64) -> io::Result<bool> {
    while *sent < len {
        let mut sbytes: libc::off_t = 0;
        let ret = unsafe {
            libc::sendfile(
                file.as_raw_fd(),
                socket,
                *sent as libc::off_t,
                0,
                std::ptr::null_mut(),
                &mut sbytes,
                0,
            )
        };
        if ret == 0 {
            *sent += sbytes as u64;
            if sbytes == 0 {
                break;
            }
            continue;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => {
                *sent += sbytes as u64;
                break;
            }
            Some(libc::EINTR) => {
                *sent += sbytes as u64;
                continue;
            }
            Some(libc::ENOSYS) if *sent == 0 => return Ok(false),
            _ => return Err(err),
        }
    }
    Ok(true)
}

/// No socket-to-file sendfile on this platform.
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub fn kernel(_socket: RawFd, _file: &File, _len: u64, _sent: &mut u64) -> io::Result<bool> {
    Ok(false)
}

/// User-space fallback: position the file at `*sent`, read a chunk into
/// `scratch`, push it to the socket, repeat until would-block or done.
pub fn buffered(
    socket: RawFd,
    file: &File,
    len: u64,
    scratch: &mut [u8],
    sent: &mut u64,
) -> io::Result<()> {
    while *sent < len {
        let n = read_chunk(file, len, scratch, *sent)?;
        if n == 0 {
            break;
        }

        let written = unsafe { libc::send(socket, scratch.as_ptr() as *const libc::c_void, n, 0) };
        if written > 0 {
            *sent += written as u64;
            continue;
        }
        if written == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => break,
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
    Ok(())
}

/// TLS variant of the buffered path: chunks go through the rustls session
/// instead of straight to the socket. `*sent` counts plaintext bytes the
/// session accepted; ciphertext still queued in the session is reported by
/// the transport as pending write.
pub fn buffered_tls<S: Read + Write>(
    session: &mut ServerConnection,
    socket: &mut S,
    file: &File,
    len: u64,
    scratch: &mut [u8],
    sent: &mut u64,
) -> ServerResult<()> {
    // Push queued records from the previous round first; if the socket is
    // still full there is no point reading more of the file.
    if !tls::flush_records(session, socket)? {
        return Ok(());
    }

    while *sent < len {
        let n = read_chunk(file, len, scratch, *sent).map_err(ServerError::Io)?;
        if n == 0 {
            break;
        }

        let accepted = session
            .writer()
            .write(&scratch[..n])
            .map_err(ServerError::Io)?;
        *sent += accepted as u64;

        if !tls::flush_records(session, socket)? {
            break;
        }
    }
    Ok(())
}

/// Seeks to `offset` and reads up to one scratch buffer of the remainder.
fn read_chunk(file: &File, len: u64, scratch: &mut [u8], offset: u64) -> io::Result<usize> {
    let seek = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, libc::SEEK_SET) };
    if seek == -1 {
        return Err(io::Error::last_os_error());
    }

    let remaining = (len - offset) as usize;
    let chunk = remaining.min(scratch.len());
    let n = unsafe {
        libc::read(
            file.as_raw_fd(),
            scratch.as_mut_ptr() as *mut libc::c_void,
            chunk,
        )
    };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
