use std::os::unix::io::RawFd;
use std::{error, fmt, io, result};

use crate::net::Family;

/// Creates a [`crate::Error::Io`] with a custom message prefixed to the current
/// `errno` value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while creating or driving tunnel sockets.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An underlying syscall failed. Socket setup and guaranteed-delivery
    /// writes fall in this category, which the tunnel cannot run without.
    Io(io::Error),
    /// An error occurred validating or resolving an address.
    Addr(AddrError),
    /// An error occurred operating on a socket handle.
    Sock(SockError),
}

impl Error {
    /// Returns `true` if this error leaves the tunnel without its transport
    /// substrate.
    ///
    /// The single top-level caller is expected to sweep the descriptor
    /// registry and terminate on a fatal error; everything else is surfaced
    /// back to the caller as a typed failure.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Io(_))
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<AddrError> for Error {
    fn from(err: AddrError) -> Error {
        Error::Addr(err)
    }
}

impl From<SockError> for Error {
    fn from(err: SockError) -> Error {
        Error::Sock(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref e) => fmt::Display::fmt(e, f),
            Error::Addr(ref e) => fmt::Display::fmt(e, f),
            Error::Sock(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

/// Represents errors that can occur validating or resolving addresses.
#[derive(Debug)]
pub enum AddrError {
    /// The textual address could not be parsed under the requested family.
    InvalidAddress {
        /// The textual address provided.
        provided: String,
        /// The address family it was parsed under.
        family: Family,
    },
    /// The address family of an operand does not match the socket it is used
    /// with.
    FamilyMismatch {
        /// The family of the socket handle.
        expected: Family,
        /// The family of the provided address.
        provided: Family,
    },
}

impl error::Error for AddrError {}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AddrError::InvalidAddress {
                ref provided,
                family,
            } => {
                write!(f, "invalid {family} address: {provided:?}")
            }
            AddrError::FamilyMismatch { expected, provided } => {
                write!(
                    f,
                    "address family mismatch: socket is {expected}, address is {provided}"
                )
            }
        }
    }
}

/// Represents errors that can occur operating on a socket handle.
#[derive(Debug)]
pub enum SockError {
    /// Raw socket creation was requested on a platform or build without raw
    /// socket support, or with a protocol the host rejects.
    ProtocolUnsupported {
        /// The requested transport-layer protocol number.
        proto: i32,
    },
    /// The socket handle was already closed, either explicitly or by the
    /// registry shutdown sweep.
    AlreadyClosed {
        /// The file descriptor the handle was bound to.
        fd: RawFd,
    },
    /// A filter program was constructed from bytes that do not form whole
    /// filter instructions.
    InvalidFilter {
        /// The length of the byte buffer provided.
        provided: usize,
        /// The fixed size of a single filter instruction.
        insn_size: usize,
    },
    /// A single error-queue entry could not be decoded. The drain skips the
    /// entry and continues.
    MalformedErrQueueEntry {
        /// Why decoding failed.
        reason: &'static str,
    },
}

impl error::Error for SockError {}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SockError::ProtocolUnsupported { proto } => {
                write!(
                    f,
                    "raw socket unsupported for protocol {proto} on this platform"
                )
            }
            SockError::AlreadyClosed { fd } => {
                write!(f, "socket fd {fd} is already closed")
            }
            SockError::InvalidFilter {
                provided,
                insn_size,
            } => {
                write!(
                    f,
                    "invalid filter program: {provided} bytes (not a multiple of the {insn_size}-byte instruction size)"
                )
            }
            SockError::MalformedErrQueueEntry { reason } => {
                write!(f, "malformed error-queue entry: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_fatal() {
        let err = Error::Io(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"));
        assert!(err.is_fatal());
    }

    #[test]
    fn typed_failures_are_not_fatal() {
        let err = Error::Addr(AddrError::InvalidAddress {
            provided: "999.0.0.1".to_string(),
            family: Family::V4,
        });
        assert!(!err.is_fatal());

        let err = Error::Sock(SockError::ProtocolUnsupported { proto: 6 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn display_names_the_failing_operand() {
        let err = Error::Addr(AddrError::FamilyMismatch {
            expected: Family::V4,
            provided: Family::V6,
        });
        let msg = err.to_string();
        assert!(msg.contains("IPv4"));
        assert!(msg.contains("IPv6"));

        let err = Error::Sock(SockError::AlreadyClosed { fd: 7 });
        assert!(err.to_string().contains("fd 7"));
    }
}
