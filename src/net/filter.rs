//! Packet-filter programs attachable at raw-socket creation.
//!
//! A program is an ordered sequence of classic BPF instructions held as owned
//! bytes; the translation to the kernel's `sock_fprog` layout happens only at
//! the socket-factory boundary. Attachment is all-or-nothing: a program is
//! wholly attached before the socket sees traffic or not attached at all.

use crate::error::SockError;
use crate::{Error, Result};

/// Size of a single filter instruction in bytes (`code`, `jt`, `jf`, `k`).
pub const FILTER_INSN_SIZE: usize = 8;

/// An ordered sequence of packet-filter instructions.
///
/// The empty program is a passthrough: the factory skips attachment entirely,
/// so all traffic is accepted. It is never interpreted as a filter that drops
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterProgram {
    insns: Vec<u8>,
}

impl FilterProgram {
    /// Creates the empty (passthrough) program.
    pub const fn empty() -> Self {
        FilterProgram { insns: Vec::new() }
    }

    /// Builds a program from `(code, jt, jf, k)` instruction tuples.
    pub fn from_instructions(insns: &[(u16, u8, u8, u32)]) -> Self {
        let mut buf = Vec::with_capacity(insns.len() * FILTER_INSN_SIZE);

        for &(code, jt, jf, k) in insns {
            // Native byte order: the buffer mirrors the in-memory instruction
            // layout handed to the kernel.
            buf.extend_from_slice(&code.to_ne_bytes());
            buf.push(jt);
            buf.push(jf);
            buf.extend_from_slice(&k.to_ne_bytes());
        }

        FilterProgram { insns: buf }
    }

    /// Builds a program from pre-encoded instruction bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::InvalidFilter`] if the buffer does not divide
    /// into whole instructions.
    pub fn from_raw_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % FILTER_INSN_SIZE != 0 {
            return Err(Error::Sock(SockError::InvalidFilter {
                provided: bytes.len(),
                insn_size: FILTER_INSN_SIZE,
            }));
        }

        Ok(FilterProgram { insns: bytes })
    }

    /// Returns the number of instructions in the program.
    pub fn len(&self) -> usize {
        self.insns.len() / FILTER_INSN_SIZE
    }

    /// Returns `true` if this is the passthrough program.
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Returns the kernel-facing `sock_fprog` view of this program, or `None`
    /// for the passthrough program.
    ///
    /// The returned structure borrows this program's buffer; it must not
    /// outlive `self`.
    #[cfg(target_os = "linux")]
    pub(crate) fn as_fprog(&self) -> Option<libc::sock_fprog> {
        if self.is_empty() {
            return None;
        }

        debug_assert_eq!(FILTER_INSN_SIZE, std::mem::size_of::<libc::sock_filter>());

        Some(libc::sock_fprog {
            len: self.len() as u16,
            filter: self.insns.as_ptr() as *mut libc::sock_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `BPF_RET | BPF_K` with an unbounded accept length.
    const ACCEPT_ALL: (u16, u8, u8, u32) = (0x06, 0, 0, u32::MAX);

    #[test]
    fn empty_program_is_passthrough() {
        let program = FilterProgram::empty();
        assert!(program.is_empty());
        assert_eq!(program.len(), 0);

        #[cfg(target_os = "linux")]
        assert!(program.as_fprog().is_none());
    }

    #[test]
    fn instruction_count_matches() {
        let program = FilterProgram::from_instructions(&[
            // Load the IP protocol byte, accept TCP only.
            (0x30, 0, 0, 9),
            (0x15, 0, 1, 6),
            ACCEPT_ALL,
            (0x06, 0, 0, 0),
        ]);
        assert_eq!(program.len(), 4);
        assert!(!program.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn fprog_reflects_instruction_layout() {
        let program = FilterProgram::from_instructions(&[ACCEPT_ALL]);
        let fprog = program.as_fprog().unwrap();
        assert_eq!(fprog.len, 1);

        // SAFETY: the fprog points at `program`'s buffer, still alive here.
        let insn = unsafe { *fprog.filter };
        assert_eq!(insn.code, 0x06);
        assert_eq!(insn.jt, 0);
        assert_eq!(insn.jf, 0);
        assert_eq!(insn.k, u32::MAX);
    }

    #[test]
    fn raw_bytes_must_divide_into_instructions() {
        let err = FilterProgram::from_raw_bytes(vec![0u8; 13]).unwrap_err();
        assert!(matches!(
            err,
            Error::Sock(SockError::InvalidFilter { provided: 13, .. })
        ));

        let program = FilterProgram::from_raw_bytes(vec![0u8; 16]).unwrap();
        assert_eq!(program.len(), 2);
    }
}
