//! Per-platform readiness engines.
//!
//! Exactly one engine is selected at build time as [`Platform`]; the
//! generic poll(2) engine additionally compiles everywhere and becomes the
//! selected engine under the `generic-poll` feature.

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub mod ports;

pub mod poll;

#[cfg(all(target_os = "linux", not(feature = "generic-poll")))]
pub use epoll::Epoll as Platform;

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    not(feature = "generic-poll")
))]
pub use kqueue::Kqueue as Platform;

#[cfg(all(
    any(target_os = "solaris", target_os = "illumos"),
    not(feature = "generic-poll")
))]
pub use ports::Ports as Platform;

#[cfg(any(
    feature = "generic-poll",
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "solaris",
        target_os = "illumos"
    ))
))]
pub use poll::Poll as Platform;
