//! Non-blocking stream transport with optional TLS.
//!
//! [`Endpoint`] is the listen side: one bound, non-blocking TCP socket plus
//! an optional shared rustls configuration. [`Conn`] is one accepted
//! socket; it exclusively owns the descriptor and, when the endpoint is a
//! TLS endpoint, its own TLS session. All operations return would-block as
//! progress states, never as errors.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ServerConfig as RustlsServerConfig, ServerConnection};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};
use crate::sendfile;
use crate::tls::{self, TlsStatus};

/// How many scratch-buffer reads `close` spends draining the peer's
/// trailing bytes before giving up.
const CLOSE_DRAIN_ROUNDS: usize = 16;

/// Per-connection socket tuning, applied right after accept.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
    pub receive_buffer: usize,
    pub send_buffer: usize,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Some platforms carry extra fields (e.g. a length byte), so the
    // structs are zero-initialized and filled field by field.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// Borrowed raw-socket adapter so rustls can read/write ciphertext.
pub(crate) struct SockRef(pub RawFd);

impl Read for SockRef {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for SockRef {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.0, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One listening socket, immutable after setup.
pub struct Endpoint {
    socket: OwnedFd,
    local_addr: SocketAddr,
    tls: Option<Arc<RustlsServerConfig>>,
    options: SocketOptions,
}

impl Endpoint {
    /// Creates, configures, binds and starts listening on `addr`.
    ///
    /// The listen socket is non-blocking with `SO_REUSEADDR`; IPv6 sockets
    /// disable v4-mapped addresses; `TCP_FASTOPEN` is enabled where the
    /// platform offers it (best effort). A port of 0 binds an ephemeral
    /// port; [`local_addr`](Endpoint::local_addr) reports the real one.
    pub fn bind(
        addr: SocketAddr,
        backlog: usize,
        tls: Option<Arc<RustlsServerConfig>>,
        options: SocketOptions,
    ) -> ServerResult<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd == -1 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        set_nonblocking(fd)?;
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32)?;
        if family == libc::AF_INET6 {
            setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, &1i32)?;
        }

        #[cfg(any(target_os = "linux", target_os = "freebsd"))]
        if let Err(e) = setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, &1i32) {
            debug!(error = %e, "TCP_FASTOPEN unavailable");
        }

        let (storage, len) = sockaddr_from(&addr);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret == -1 {
            return Err(ServerError::BindFailed {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        if unsafe { libc::listen(fd, backlog as libc::c_int) } == -1 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }

        // Re-read the address: port 0 got a real port assigned.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret =
            unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
        if ret == -1 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        let local_addr = sockaddr_to(&storage).unwrap_or(addr);

        Ok(Self {
            socket,
            local_addr,
            tls,
            options,
        })
    }

    /// The actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The raw listen descriptor, for poller registration.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Returns true when this endpoint terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Performs one non-blocking accept.
    ///
    /// `Ok(None)` means the accept queue is drained. An accepted `Conn`
    /// already carries its TLS session when the endpoint is a TLS endpoint,
    /// but has not been tuned yet; call [`Conn::setup`] next.
    pub fn accept(&self) -> ServerResult<Option<Conn>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.socket.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(ServerError::Io(err));
        }
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer = sockaddr_to(&storage)
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

        let tls = match &self.tls {
            Some(config) => Some(
                ServerConnection::new(Arc::clone(config))
                    .map_err(|e| ServerError::Tls(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Some(Conn {
            socket,
            peer,
            tls,
            tls_established: false,
        }))
    }

    pub(crate) fn options(&self) -> &SocketOptions {
        &self.options
    }
}

/// One accepted connection. Owns its descriptor; the owning endpoint is
/// only referenced through the TLS configuration baked into the session.
pub struct Conn {
    socket: OwnedFd,
    peer: SocketAddr,
    tls: Option<ServerConnection>,
    tls_established: bool,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.socket.as_raw_fd())
            .field("peer", &self.peer)
            .field("tls", &self.tls.is_some())
            .field("tls_established", &self.tls_established)
            .finish()
    }
}

impl Conn {
    /// The raw connection descriptor, for poller registration.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Peer address as reported by accept.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true when this connection carries a TLS session.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns true once the TLS handshake finished.
    pub fn tls_established(&self) -> bool {
        self.tls_established
    }

    /// Applies per-connection socket options.
    ///
    /// Non-blocking mode and `SO_LINGER {on, 0}` (RST on close, for fast
    /// descriptor reuse) must succeed; the tuning options are best effort
    /// and only logged on failure.
    pub fn setup(&mut self, options: &SocketOptions) -> ServerResult<()> {
        let fd = self.socket.as_raw_fd();
        set_nonblocking(fd)?;

        if let Err(e) = setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32) {
            warn!(error = %e, "TCP_NODELAY failed");
        }

        let timeout = |d: Duration| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        };
        if let Err(e) = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout(options.receive_timeout),
        ) {
            warn!(error = %e, "SO_RCVTIMEO failed");
        }
        if let Err(e) = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &timeout(options.send_timeout),
        ) {
            warn!(error = %e, "SO_SNDTIMEO failed");
        }
        if let Err(e) = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &(options.receive_buffer as libc::c_int),
        ) {
            warn!(error = %e, "SO_RCVBUF failed");
        }
        if let Err(e) = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &(options.send_buffer as libc::c_int),
        ) {
            warn!(error = %e, "SO_SNDBUF failed");
        }
        if let Err(e) = setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32) {
            warn!(error = %e, "SO_KEEPALIVE failed");
        }

        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)?;

        Ok(())
    }

    /// Drives the TLS handshake one step.
    ///
    /// Plaintext connections report [`TlsStatus::Plain`] immediately. A TLS
    /// connection stays [`TlsStatus::InProgress`] across want-read /
    /// want-write rounds; callers must not receive or send application data
    /// until this returns [`TlsStatus::Established`].
    pub fn establish_tls(&mut self) -> ServerResult<TlsStatus> {
        let fd = self.socket.as_raw_fd();
        let Some(session) = self.tls.as_mut() else {
            return Ok(TlsStatus::Plain);
        };
        if self.tls_established {
            return Ok(TlsStatus::Established);
        }
        let mut sock = SockRef(fd);
        let status = tls::drive_handshake(session, &mut sock)?;
        if status == TlsStatus::Established {
            self.tls_established = true;
        }
        Ok(status)
    }

    /// Reads the pending socket error (`SO_ERROR`), clearing it.
    pub fn take_error(&self) -> i32 {
        let mut error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == -1 {
            warn!(error = %io::Error::last_os_error(), "SO_ERROR read failed");
        }
        error
    }

    /// Drains the socket into `buf[*received..]` until would-block or the
    /// buffer is full, advancing `received`.
    ///
    /// A zero-byte result is not an error here: the caller decides whether
    /// it expected data (peer close) or not (spurious event).
    pub fn receive(&mut self, buf: &mut [u8], received: &mut usize) -> ServerResult<()> {
        let fd = self.socket.as_raw_fd();
        if let Some(session) = self.tls.as_mut() {
            let mut sock = SockRef(fd);
            tls::read_plaintext(session, &mut sock, buf, received)?;
            return Ok(());
        }

        while *received < buf.len() {
            let n = unsafe {
                libc::recv(
                    fd,
                    buf[*received..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - *received,
                    0,
                )
            };
            if n > 0 {
                *received += n as usize;
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(ServerError::Io(err)),
            }
        }
        Ok(())
    }

    /// Writes `buf[*sent..]` until drained or would-block, advancing
    /// `sent`. Idempotent on partial sends: re-enter with the same buffer.
    pub fn send(&mut self, buf: &[u8], sent: &mut usize) -> ServerResult<()> {
        let fd = self.socket.as_raw_fd();
        if let Some(session) = self.tls.as_mut() {
            let mut sock = SockRef(fd);
            return tls::write_plaintext(session, &mut sock, buf, sent);
        }

        while *sent < buf.len() {
            let n = unsafe {
                libc::send(
                    fd,
                    buf[*sent..].as_ptr() as *const libc::c_void,
                    buf.len() - *sent,
                    0,
                )
            };
            if n > 0 {
                *sent += n as usize;
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(ServerError::Io(err)),
            }
        }
        Ok(())
    }

    /// Transmits file contents, resuming at `*sent`.
    ///
    /// Runtime selection: TLS sessions use the buffered TLS path; plaintext
    /// uses the kernel `sendfile` where the platform has one and falls back
    /// to the buffered path otherwise. `scratch` backs the buffered paths.
    pub fn sendfile(
        &mut self,
        file: &File,
        len: u64,
        scratch: &mut [u8],
        sent: &mut u64,
    ) -> ServerResult<()> {
        let fd = self.socket.as_raw_fd();
        if let Some(session) = self.tls.as_mut() {
            let mut sock = SockRef(fd);
            return sendfile::buffered_tls(session, &mut sock, file, len, scratch, sent);
        }

        match sendfile::kernel(fd, file, len, sent) {
            Ok(true) => Ok(()),
            Ok(false) => sendfile::buffered(fd, file, len, scratch, sent).map_err(ServerError::Io),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    /// True while the TLS session holds records not yet pushed to the
    /// socket. Counted as remaining write by the job layer.
    pub fn tls_pending_write(&self) -> bool {
        self.tls.as_ref().is_some_and(|s| s.wants_write())
    }

    /// Closes the connection: TLS close-notify (when established),
    /// `shutdown(WR)`, a bounded drain of trailing bytes, then the
    /// descriptor is closed on drop.
    pub fn close(&mut self, scratch: &mut [u8]) {
        let fd = self.socket.as_raw_fd();
        if self.tls_established {
            if let Some(session) = self.tls.as_mut() {
                session.send_close_notify();
                let mut sock = SockRef(fd);
                if let Err(e) = tls::flush_records(session, &mut sock) {
                    debug!(error = %e, "close-notify flush failed");
                }
            }
        }

        if unsafe { libc::shutdown(fd, libc::SHUT_WR) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotConnected {
                debug!(error = %err, "shutdown failed");
            }
        }

        for _ in 0..CLOSE_DRAIN_ROUNDS {
            let n =
                unsafe { libc::recv(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len(), 0) };
            if n > 0 {
                continue;
            }
            if n == -1 {
                let err = io::Error::last_os_error();
                if !matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) {
                    debug!(error = %err, "close drain failed");
                }
            }
            break;
        }
    }
}
