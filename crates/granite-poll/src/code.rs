//! Readiness event codes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A small bit set describing readiness interest or a delivered event.
///
/// `READ` and `WRITE` may be requested at registration time; `ERROR` and
/// `CLOSE` are only ever delivered. `EDGE` requests edge-triggered delivery:
/// the consumer must then drain the descriptor to would-block before
/// returning from the event callback, or the next edge is lost.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Code(u8);

impl Code {
    /// The descriptor is readable.
    pub const READ: Code = Code(0x01);
    /// The descriptor is writable.
    pub const WRITE: Code = Code(0x02);
    /// An error condition is pending on the descriptor.
    pub const ERROR: Code = Code(0x08);
    /// The peer closed its end.
    pub const CLOSE: Code = Code(0x10);
    /// Edge-triggered delivery.
    pub const EDGE: Code = Code(0x80);

    /// The empty code.
    pub const fn empty() -> Code {
        Code(0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Code) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Code {
    type Output = Code;

    fn bitor(self, rhs: Code) -> Code {
        Code(self.0 | rhs.0)
    }
}

impl BitOrAssign for Code {
    fn bitor_assign(&mut self, rhs: Code) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if self.contains(Code::READ) {
            parts.push("READ");
        }
        if self.contains(Code::WRITE) {
            parts.push("WRITE");
        }
        if self.contains(Code::ERROR) {
            parts.push("ERROR");
        }
        if self.contains(Code::CLOSE) {
            parts.push("CLOSE");
        }
        if self.contains(Code::EDGE) {
            parts.push("EDGE");
        }
        if parts.is_empty() {
            write!(f, "Code(empty)")
        } else {
            write!(f, "Code({})", parts.join("|"))
        }
    }
}

/// Opaque per-registration value returned with every delivered event.
///
/// Callers typically use it as an index into their own slot table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Token(pub usize);

/// One delivered readiness record.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    /// Union of the conditions that fired.
    pub code: Code,
    /// The token supplied at registration.
    pub token: Token,
}
