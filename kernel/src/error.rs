//! Kernel error types
//!
//! Every validation failure at the kernel boundary is reported to user space
//! as a small positive error number; the negated value travels back in the
//! first syscall return word. Internal invariant violations panic instead.

use core::fmt;

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, Errno>;

/// Kernel-wide error numbers
///
/// The discriminants are part of the user-space ABI and must not be
/// renumbered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum Errno {
    /// Resource exhausted
    NoMemory = 1,
    /// Unrecognised system call
    NoSys = 2,
    /// Malformed argument
    Invalid = 3,
    /// Transient failure, retry may succeed
    Again = 4,
    /// Descriptor not in use or wrong type
    BadDescriptor = 5,
    /// Peer gone (endpoint destroyed, thread died during IPC)
    Io = 6,
    /// Missing permission bit
    NotPermitted = 7,
    /// Message exceeds size cap
    TooBig = 8,
    /// Reply without a pending sender
    NoMessage = 9,
    /// Operation not supported
    NotSupported = 10,
    /// Thread not in a startable state
    Busy = 11,
    /// Target thread missing
    NoSuchThread = 12,
    /// Self-join
    Deadlock = 13,
    /// Protocol violation
    Protocol = 14,
}

impl Errno {
    /// Static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMemory => "out of memory",
            Self::NoSys => "unrecognised system call",
            Self::Invalid => "invalid argument",
            Self::Again => "temporary failure",
            Self::BadDescriptor => "bad descriptor",
            Self::Io => "peer gone",
            Self::NotPermitted => "permission denied",
            Self::TooBig => "message too large",
            Self::NoMessage => "no pending sender",
            Self::NotSupported => "operation not supported",
            Self::Busy => "thread not startable",
            Self::NoSuchThread => "no such thread",
            Self::Deadlock => "deadlock avoided",
            Self::Protocol => "protocol violation",
        }
    }

    /// The positive error number delivered in the second return word
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The negative status delivered in the first return word
    #[inline]
    pub fn status(self) -> isize {
        -(self as i32 as isize)
    }

    /// Reconstruct an errno from its positive error number.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::NoMemory,
            2 => Self::NoSys,
            3 => Self::Invalid,
            4 => Self::Again,
            5 => Self::BadDescriptor,
            6 => Self::Io,
            7 => Self::NotPermitted,
            8 => Self::TooBig,
            9 => Self::NoMessage,
            10 => Self::NotSupported,
            11 => Self::Busy,
            12 => Self::NoSuchThread,
            13 => Self::Deadlock,
            14 => Self::Protocol,
            _ => return None,
        })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn error_numbers_are_abi_stable() {
        assert_eq!(Errno::NoMemory.code(), 1);
        assert_eq!(Errno::NoSys.code(), 2);
        assert_eq!(Errno::Invalid.code(), 3);
        assert_eq!(Errno::Again.code(), 4);
        assert_eq!(Errno::BadDescriptor.code(), 5);
        assert_eq!(Errno::Io.code(), 6);
        assert_eq!(Errno::NotPermitted.code(), 7);
        assert_eq!(Errno::TooBig.code(), 8);
        assert_eq!(Errno::NoMessage.code(), 9);
        assert_eq!(Errno::NotSupported.code(), 10);
        assert_eq!(Errno::Busy.code(), 11);
        assert_eq!(Errno::NoSuchThread.code(), 12);
        assert_eq!(Errno::Deadlock.code(), 13);
        assert_eq!(Errno::Protocol.code(), 14);
    }

    #[test]
    fn status_is_negated_code() {
        assert_eq!(Errno::Io.status(), -6);
        assert_eq!(Errno::Deadlock.status(), -13);
    }
}
