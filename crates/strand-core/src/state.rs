//! Fiber state and I/O event interest types

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Lifecycle state of a fiber.
///
/// A fiber is created `Ready`, becomes `Running` when resumed, goes back
/// to `Ready` when it yields and ends in `Term` once its closure returned.
/// A thread's implicit main fiber is always `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Resumable
    Ready = 0,

    /// Currently executing on some thread
    Running = 1,

    /// Closure returned; only `reset` can revive it
    Term = 2,
}

impl FiberState {
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Ready => "READY",
            FiberState::Running => "RUNNING",
            FiberState::Term => "TERM",
        };
        f.write_str(s)
    }
}

/// I/O readiness interest on a descriptor.
///
/// The bit values match `EPOLLIN` and `EPOLLOUT`, so a set can be handed
/// to epoll without translation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn remove(&mut self, other: Event) {
        self.0 &= !other.0;
    }
}

impl BitOr for Event {
    type Output = Event;
    #[inline]
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    #[inline]
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    #[inline]
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    #[inline]
    fn not(self) -> Event {
        Event::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.intersects(Event::READ), self.intersects(Event::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}
