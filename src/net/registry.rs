//! Process-wide bookkeeping of open socket descriptors.
//!
//! The registry is an explicit object passed to every component that creates
//! or closes sockets, rather than an implicit global, so unit tests can run
//! several registries side by side while production wiring holds a single
//! instance at the top level.

use std::os::unix::io::RawFd;

use crate::{debug, warn};

/// Table of open socket descriptors with a bounded lifetime.
///
/// Guarantees single-close: exactly one of an explicit [`close`] through the
/// owning handle or the [`close_all`] shutdown sweep retires a descriptor.
/// The sweep is invoked at orderly shutdown and on the fatal-termination path
/// so that a die-and-exit never leaks descriptors.
///
/// [`close`]: crate::net::SockFd::close
/// [`close_all`]: FdRegistry::close_all
#[derive(Debug, Default)]
pub struct FdRegistry {
    entries: Vec<Entry>,
    next_ordinal: u64,
}

#[derive(Debug)]
struct Entry {
    fd: RawFd,
    /// Creation ordinal; the sweep closes descriptors in creation order.
    ordinal: u64,
}

impl FdRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open descriptor for the shutdown sweep.
    ///
    /// Registering a descriptor that is already present is a bookkeeping bug
    /// in the caller; the duplicate is dropped with a diagnostic so no two
    /// live entries ever share a descriptor.
    pub fn register(&mut self, fd: RawFd) {
        if self.contains(fd) {
            warn!("fd {fd} is already registered, ignoring duplicate");
            return;
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        self.entries.push(Entry { fd, ordinal });
    }

    /// Removes a descriptor from the table without closing it.
    ///
    /// Unregistering an absent descriptor is a no-op, not an error.
    pub fn unregister(&mut self, fd: RawFd) {
        self.entries.retain(|entry| entry.fd != fd);
    }

    /// Returns `true` if the descriptor is currently registered.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|entry| entry.fd == fd)
    }

    /// Returns the number of registered descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no descriptors are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes every still-registered descriptor and empties the table.
    ///
    /// After the sweep the registry is reusable; subsequent registrations
    /// start a fresh generation.
    pub fn close_all(&mut self) {
        for entry in self.entries.drain(..) {
            debug!("sweep closing fd {} (created #{})", entry.fd, entry.ordinal);

            if unsafe { libc::close(entry.fd) } == -1 {
                let err = std::io::Error::last_os_error();
                warn!("failed to close fd {} during sweep: {err}", entry.fd);
            }
        }
    }
}
