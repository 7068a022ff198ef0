//! Syscall wrappers with a uniform fatal/recoverable failure policy.
//!
//! Transport setup and guaranteed-delivery writes are infrastructure the
//! tunnel cannot run without, so their failures propagate as I/O errors the
//! top level treats as fatal. Data-plane reads are inherently lossy, so
//! [`try_recv`] fails soft: any underlying failure reads as "no data this
//! cycle". [`wait_readable`] is the single multiplexing point; a timeout
//! there is a normal outcome, never an error.

use std::io::{self, Write};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{AddrError, errno};
use crate::net::addr::{self, Family};
use crate::net::socket::SockFd;
use crate::{Error, Result, debug};

/// Sends a datagram to the given address.
///
/// # Errors
///
/// Fails with [`AddrError::FamilyMismatch`] when the destination family does
/// not match the socket's; any send failure is an I/O error the top level
/// treats as fatal.
pub fn send_to(sock: &SockFd, dst: &SocketAddr, buf: &[u8]) -> Result<usize> {
    sock.ensure_open()?;

    if Family::of(dst) != sock.family() {
        return Err(Error::Addr(AddrError::FamilyMismatch {
            expected: sock.family(),
            provided: Family::of(dst),
        }));
    }

    let (sa, len) = addr::to_raw(dst);
    let nbytes = unsafe {
        libc::sendto(
            sock.fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &raw const sa as *const libc::sockaddr,
            len,
        )
    };
    if nbytes == -1 {
        return Err(errno!("failed to send {} bytes to {dst}", buf.len()));
    }

    Ok(nbytes as usize)
}

/// Receives a datagram along with its source address, blocking until one
/// arrives.
///
/// # Errors
///
/// Any receive failure is an I/O error the top level treats as fatal; use
/// [`try_recv`] for the lossy data-plane path.
pub fn recv_from(sock: &SockFd, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
    sock.ensure_open()?;

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let nbytes = unsafe {
        libc::recvfrom(
            sock.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &raw mut storage as *mut libc::sockaddr,
            &mut slen,
        )
    };
    if nbytes == -1 {
        return Err(errno!("failed to receive on socket fd {}", sock.fd()));
    }

    let peer = addr::from_raw(&storage).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "peer address family {} not recognized on fd {}",
                storage.ss_family,
                sock.fd()
            ),
        ))
    })?;

    Ok((nbytes as usize, peer))
}

/// Best-effort receive without source tracking.
///
/// Returns `None` on any underlying failure, including an empty socket;
/// callers retry on the next readiness signal. Never terminates and never
/// blocks.
pub fn try_recv(sock: &SockFd, buf: &mut [u8]) -> Option<usize> {
    if sock.is_closed() {
        return None;
    }

    let nbytes = unsafe {
        libc::recv(
            sock.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if nbytes == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
            debug!("recv on fd {} failed: {err}", sock.fd());
        }
        return None;
    }

    Some(nbytes as usize)
}

/// Reads from a descriptor, blocking until data is available.
///
/// # Errors
///
/// Any read failure is an I/O error the top level treats as fatal.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let nbytes = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if nbytes == -1 {
        return Err(errno!("failed to read from fd {fd}"));
    }

    Ok(nbytes as usize)
}

/// Writes the whole buffer to a descriptor, retrying on interruption and
/// short writes.
///
/// # Errors
///
/// Any write failure is an I/O error the top level treats as fatal.
pub fn write_all(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let mut written = 0;

    while written < buf.len() {
        let nbytes = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if nbytes == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(errno!("failed to write {} bytes to fd {fd}", buf.len()));
        }

        written += nbytes as usize;
    }

    Ok(written)
}

/// Writes the whole buffer to a buffered writer and flushes it.
///
/// # Errors
///
/// Any write or flush failure is an I/O error the top level treats as fatal.
pub fn fwrite_all(out: &mut impl Write, buf: &[u8]) -> Result<usize> {
    out.write_all(buf)?;
    out.flush()?;
    Ok(buf.len())
}

/// Blocks until at least one of the descriptors is readable or the timeout
/// elapses, returning the ready subset.
///
/// `None` waits indefinitely; a zero duration is a non-blocking poll. An
/// empty ready set on timeout is a normal outcome. Descriptors signalling
/// error or hangup conditions are also reported ready so the caller can
/// observe the failure on its next operation.
///
/// # Errors
///
/// Only an unexpected failure of the wait primitive itself is an error;
/// interruption by a signal is retried.
pub fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> Result<Vec<RawFd>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(timeout) => libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX),
    };

    loop {
        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ready == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(errno!("failed to wait on {} descriptors", fds.len()));
        }

        return Ok(pollfds
            .iter()
            .filter(|pollfd| (pollfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP)) != 0)
            .map(|pollfd| pollfd.fd)
            .collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::registry::FdRegistry;
    use crate::net::socket::udp_sock;

    #[test]
    fn loopback_round_trip() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        let sent = send_to(&sock, &sock.local_addr(), b"PING").unwrap();
        assert_eq!(sent, 4);

        let ready = wait_readable(&[sock.fd()], Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready, vec![sock.fd()]);

        let mut buf = [0u8; 64];
        let nbytes = try_recv(&sock, &mut buf).unwrap();
        assert_eq!(&buf[..nbytes], b"PING");

        sock.close(&mut registry).unwrap();
    }

    #[test]
    fn recv_from_reports_source() {
        let mut registry = FdRegistry::new();
        let mut tx = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();
        let mut rx = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        send_to(&tx, &rx.local_addr(), b"hello").unwrap();

        let mut buf = [0u8; 64];
        let (nbytes, peer) = recv_from(&rx, &mut buf).unwrap();
        assert_eq!(&buf[..nbytes], b"hello");
        assert_eq!(peer, tx.local_addr());

        tx.close(&mut registry).unwrap();
        rx.close(&mut registry).unwrap();
    }

    #[test]
    fn send_family_mismatch_is_typed_failure() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        let dst: SocketAddr = "[::1]:4433".parse().unwrap();
        let err = send_to(&sock, &dst, b"PING").unwrap_err();
        assert!(matches!(
            err,
            Error::Addr(AddrError::FamilyMismatch { .. })
        ));
        assert!(!err.is_fatal());

        sock.close(&mut registry).unwrap();
    }

    #[test]
    fn try_recv_empty_socket_is_no_data() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(try_recv(&sock, &mut buf), None);

        sock.close(&mut registry).unwrap();
    }

    #[test]
    fn closed_handle_fails_io() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();
        let dst = sock.local_addr();
        sock.close(&mut registry).unwrap();

        assert!(send_to(&sock, &dst, b"PING").is_err());
        let mut buf = [0u8; 16];
        assert!(recv_from(&sock, &mut buf).is_err());
        assert_eq!(try_recv(&sock, &mut buf), None);
    }

    #[test]
    fn zero_timeout_poll_returns_promptly() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        let ready = wait_readable(&[sock.fd()], Some(Duration::ZERO)).unwrap();
        assert!(ready.is_empty());

        sock.close(&mut registry).unwrap();
    }

    #[test]
    fn pipe_write_read_round_trip() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [rx, tx] = fds;

        assert_eq!(write_all(tx, b"tunneled").unwrap(), 8);

        let mut buf = [0u8; 16];
        let nbytes = read(rx, &mut buf).unwrap();
        assert_eq!(&buf[..nbytes], b"tunneled");

        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn fwrite_all_flushes_buffered_writer() {
        let mut out = Vec::new();
        assert_eq!(fwrite_all(&mut out, b"diag\n").unwrap(), 5);
        assert_eq!(out, b"diag\n");
    }
}
