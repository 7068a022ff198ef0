//! Draining a socket's asynchronous error channel.
//!
//! Raw and UDP sockets surface network-layer failures (unreachable
//! destinations, fragmentation-needed notifications) out-of-band from
//! ordinary data delivery. Each queued entry is decoded into an
//! [`ErrReport`] and handed to the tunnel state machine through the narrow
//! [`TunnelState`] callback; without this drain the tunnel never sees path
//! failures that ordinary reads cannot observe.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::net::socket::SockFd;
use crate::{Result, warn};

/// Extended-error origin value for ICMP notifications.
///
/// Kernel ABI values; not exposed through `libc` on every target.
const EE_ORIGIN_ICMP: u8 = 2;
/// Extended-error origin value for ICMPv6 notifications.
const EE_ORIGIN_ICMP6: u8 = 3;

/// ICMP destination-unreachable type.
const ICMP_DEST_UNREACH: u8 = 3;
/// ICMP fragmentation-needed code under destination-unreachable.
const ICMP_FRAG_NEEDED: u8 = 4;
/// ICMPv6 packet-too-big type.
const ICMP6_PACKET_TOO_BIG: u8 = 2;

/// Callback contract toward the tunnel's protocol state machine.
///
/// The implementation must be fire-and-forget: it takes ownership of the
/// report's content and must not block the drain. What the state machine
/// does with a report (adjusting path assumptions, tearing down a peer) is
/// its own concern.
pub trait TunnelState {
    /// Delivers one decoded network-error notification.
    fn report_network_error(
        &mut self,
        peer: Option<SocketAddr>,
        category: u8,
        code: u8,
        payload: &[u8],
    );
}

/// A decoded entry from a socket's error queue.
///
/// Created and consumed within a single drain cycle; once forwarded to the
/// tunnel state the content belongs to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrReport {
    /// The offending peer that triggered the notification, when the kernel
    /// recorded one.
    pub peer: Option<SocketAddr>,
    /// Notification category (ICMP-style type).
    pub category: u8,
    /// Notification sub-code within the category.
    pub code: u8,
    /// Origin of the notification (local stack, ICMP, ICMPv6).
    pub origin: u8,
    /// The `errno` value the kernel attached to the entry.
    pub err: i32,
    /// Category-specific word, e.g. the next-hop MTU for
    /// fragmentation-needed entries.
    pub info: u32,
    /// Snippet of the original datagram returned alongside the entry.
    pub payload: Vec<u8>,
}

impl ErrReport {
    /// Returns the next-hop MTU for fragmentation-needed / packet-too-big
    /// notifications, the path condition the tunnel most needs to react to.
    pub fn mtu_hint(&self) -> Option<u32> {
        match (self.origin, self.category, self.code) {
            (EE_ORIGIN_ICMP, ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED) => Some(self.info),
            (EE_ORIGIN_ICMP6, ICMP6_PACKET_TOO_BIG, _) => Some(self.info),
            _ => None,
        }
    }
}

/// Drains the socket's error queue without blocking.
///
/// Entries are decoded in arrival order with no deduplication. For each
/// decoded entry the `state` callback is invoked exactly once when provided,
/// and the raw payload is re-emitted on `forward_fd` when provided (to relay
/// the condition toward whichever side must react). Malformed entries are
/// skipped with a diagnostic; the drain continues.
///
/// An empty queue yields an empty list immediately.
///
/// # Errors
///
/// Only an unexpected receive failure on the queue itself is an error.
pub fn drain(
    sock: &SockFd,
    scratch: &mut [u8],
    forward_fd: Option<RawFd>,
    mut state: Option<&mut dyn TunnelState>,
) -> Result<Vec<ErrReport>> {
    sock.ensure_open()?;

    let mut reports = Vec::new();

    #[cfg(target_os = "linux")]
    {
        use std::io;
        use std::mem;

        use crate::error::errno;

        loop {
            let mut control = [0u8; 512];
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            };

            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = &raw mut storage as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();

            let nbytes = unsafe {
                libc::recvmsg(sock.fd(), &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
            };
            if nbytes == -1 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    // Queue exhausted.
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        return Err(errno!(
                            "failed to drain error queue on fd {}",
                            sock.fd()
                        ));
                    }
                }
            }
            let payload = &scratch[..nbytes as usize];

            // Walk the control messages of this entry; the extended error
            // and its offender address arrive as one of them.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let level = (*cmsg).cmsg_level;
                    let ctype = (*cmsg).cmsg_type;

                    let header = libc::CMSG_LEN(0) as usize;
                    let total = (*cmsg).cmsg_len as usize;
                    let data = if total > header {
                        std::slice::from_raw_parts(
                            libc::CMSG_DATA(cmsg) as *const u8,
                            total - header,
                        )
                    } else {
                        &[]
                    };

                    match decode_entry(level, ctype, data, payload) {
                        Ok(Some(report)) => {
                            dispatch(&report, forward_fd, &mut state)?;
                            reports.push(report);
                        }
                        // A control message unrelated to the error queue.
                        Ok(None) => {}
                        Err(err) => {
                            warn!("skipping error-queue entry on fd {}: {err}", sock.fd());
                        }
                    }

                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        // No asynchronous error channel on this target; the queue is
        // permanently empty.
        let _ = (scratch, forward_fd, &mut state);
    }

    Ok(reports)
}

/// Forwards one decoded report: the tunnel-state callback exactly once, and
/// the raw payload onto the relay descriptor.
fn dispatch(
    report: &ErrReport,
    forward_fd: Option<RawFd>,
    state: &mut Option<&mut dyn TunnelState>,
) -> Result<()> {
    if let Some(state) = state {
        state.report_network_error(report.peer, report.category, report.code, &report.payload);
    }

    if let Some(out) = forward_fd {
        if !report.payload.is_empty() {
            crate::net::io::write_all(out, &report.payload)?;
        }
    }

    Ok(())
}

/// Decodes a single control message into an [`ErrReport`].
///
/// Returns `Ok(None)` for control messages that are not extended-error
/// entries; fails only when an entry claims to be one but its bytes do not
/// form a whole extended-error structure.
#[cfg(target_os = "linux")]
fn decode_entry(
    level: i32,
    ctype: i32,
    data: &[u8],
    payload: &[u8],
) -> Result<Option<ErrReport>> {
    use std::mem;
    use std::ptr;

    use crate::Error;
    use crate::error::SockError;

    let is_err_entry = (level == libc::IPPROTO_IP && ctype == libc::IP_RECVERR)
        || (level == libc::IPPROTO_IPV6 && ctype == libc::IPV6_RECVERR);
    if !is_err_entry {
        return Ok(None);
    }

    let ee_size = mem::size_of::<libc::sock_extended_err>();
    if data.len() < ee_size {
        return Err(Error::Sock(SockError::MalformedErrQueueEntry {
            reason: "control data shorter than the extended error structure",
        }));
    }

    // SAFETY: length checked above; the control buffer need not be aligned.
    let ee = unsafe { ptr::read_unaligned(data.as_ptr() as *const libc::sock_extended_err) };

    // The offender's address, when recorded, trails the extended error.
    let peer = parse_offender(&data[ee_size..]);

    Ok(Some(ErrReport {
        peer,
        category: ee.ee_type,
        code: ee.ee_code,
        origin: ee.ee_origin,
        err: ee.ee_errno as i32,
        info: ee.ee_info,
        payload: payload.to_vec(),
    }))
}

/// Reads the offender socket address trailing an extended-error entry, if
/// one was recorded.
#[cfg(target_os = "linux")]
fn parse_offender(data: &[u8]) -> Option<SocketAddr> {
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use std::ptr;

    if data.len() < 2 {
        return None;
    }
    let family = i32::from(u16::from_ne_bytes([data[0], data[1]]));

    if family == libc::AF_INET && data.len() >= mem::size_of::<libc::sockaddr_in>() {
        // SAFETY: length checked; unaligned read from the control buffer.
        let sin = unsafe { ptr::read_unaligned(data.as_ptr() as *const libc::sockaddr_in) };
        return Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
            u16::from_be(sin.sin_port),
        )));
    }

    if family == libc::AF_INET6 && data.len() >= mem::size_of::<libc::sockaddr_in6>() {
        // SAFETY: as above.
        let sin6 = unsafe { ptr::read_unaligned(data.as_ptr() as *const libc::sockaddr_in6) };
        return Some(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(sin6.sin6_addr.s6_addr),
            u16::from_be(sin6.sin6_port),
            sin6.sin6_flowinfo,
            sin6.sin6_scope_id,
        )));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::registry::FdRegistry;
    use crate::net::socket::udp_sock;
    use crate::net::{Family, io};

    /// Records every callback invocation.
    struct RecordingState {
        calls: Vec<(Option<SocketAddr>, u8, u8, Vec<u8>)>,
    }

    impl TunnelState for RecordingState {
        fn report_network_error(
            &mut self,
            peer: Option<SocketAddr>,
            category: u8,
            code: u8,
            payload: &[u8],
        ) {
            self.calls.push((peer, category, code, payload.to_vec()));
        }
    }

    #[test]
    fn drain_empty_queue_is_empty_and_prompt() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();

        let mut scratch = [0u8; 1500];
        let reports = drain(&sock, &mut scratch, None, None).unwrap();
        assert!(reports.is_empty());

        sock.close(&mut registry).unwrap();
    }

    #[test]
    fn drain_closed_handle_fails() {
        let mut registry = FdRegistry::new();
        let mut sock = udp_sock(Family::V4, 0, Some("127.0.0.1"), false, &mut registry).unwrap();
        sock.close(&mut registry).unwrap();

        let mut scratch = [0u8; 64];
        assert!(drain(&sock, &mut scratch, None, None).is_err());
    }

    #[test]
    fn dispatch_invokes_callback_exactly_once() {
        let peer: SocketAddr = "192.0.2.99:443".parse().unwrap();
        let report = ErrReport {
            peer: Some(peer),
            category: ICMP_DEST_UNREACH,
            code: ICMP_FRAG_NEEDED,
            origin: EE_ORIGIN_ICMP,
            err: libc::EMSGSIZE,
            info: 1280,
            payload: b"orig-datagram".to_vec(),
        };

        let mut state = RecordingState { calls: Vec::new() };
        {
            let mut state: Option<&mut dyn TunnelState> = Some(&mut state);
            dispatch(&report, None, &mut state).unwrap();
        }

        assert_eq!(state.calls.len(), 1);
        let (got_peer, category, code, payload) = &state.calls[0];
        assert_eq!(*got_peer, Some(peer));
        assert_eq!(*category, ICMP_DEST_UNREACH);
        assert_eq!(*code, ICMP_FRAG_NEEDED);
        assert_eq!(payload, b"orig-datagram");
    }

    #[test]
    fn dispatch_relays_payload_to_forward_fd() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [rx, tx] = fds;

        let report = ErrReport {
            peer: None,
            category: ICMP_DEST_UNREACH,
            code: 0,
            origin: EE_ORIGIN_ICMP,
            err: libc::EHOSTUNREACH,
            info: 0,
            payload: b"relayed".to_vec(),
        };

        let mut state: Option<&mut dyn TunnelState> = None;
        dispatch(&report, Some(tx), &mut state).unwrap();

        let mut buf = [0u8; 32];
        let nbytes = io::read(rx, &mut buf).unwrap();
        assert_eq!(&buf[..nbytes], b"relayed");

        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn mtu_hint_only_for_fragmentation_entries() {
        let frag = ErrReport {
            peer: None,
            category: ICMP_DEST_UNREACH,
            code: ICMP_FRAG_NEEDED,
            origin: EE_ORIGIN_ICMP,
            err: libc::EMSGSIZE,
            info: 1400,
            payload: Vec::new(),
        };
        assert_eq!(frag.mtu_hint(), Some(1400));

        let too_big = ErrReport {
            origin: EE_ORIGIN_ICMP6,
            category: ICMP6_PACKET_TOO_BIG,
            code: 0,
            info: 1280,
            ..frag.clone()
        };
        assert_eq!(too_big.mtu_hint(), Some(1280));

        let unreachable = ErrReport {
            code: 1,
            info: 0,
            ..frag.clone()
        };
        assert_eq!(unreachable.mtu_hint(), None);
    }

    #[cfg(target_os = "linux")]
    mod decode {
        use super::super::*;
        use std::mem;
        use std::net::SocketAddrV4;

        /// Builds the control-message data bytes of a fragmentation-needed
        /// entry: the extended error followed by the offender address.
        fn frag_needed_entry(mtu: u32, offender: SocketAddrV4) -> Vec<u8> {
            let ee = libc::sock_extended_err {
                ee_errno: libc::EMSGSIZE as u32,
                ee_origin: EE_ORIGIN_ICMP,
                ee_type: ICMP_DEST_UNREACH,
                ee_code: ICMP_FRAG_NEEDED,
                ee_pad: 0,
                ee_info: mtu,
                ee_data: 0,
            };

            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: offender.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*offender.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };

            let mut data = Vec::new();
            data.extend_from_slice(unsafe {
                std::slice::from_raw_parts(
                    &raw const ee as *const u8,
                    mem::size_of::<libc::sock_extended_err>(),
                )
            });
            data.extend_from_slice(unsafe {
                std::slice::from_raw_parts(
                    &raw const sin as *const u8,
                    mem::size_of::<libc::sockaddr_in>(),
                )
            });
            data
        }

        #[test]
        fn decode_fragmentation_needed_entry() {
            let offender: SocketAddrV4 = "198.51.100.1:0".parse().unwrap();
            let data = frag_needed_entry(1400, offender);

            let report = decode_entry(libc::IPPROTO_IP, libc::IP_RECVERR, &data, b"snippet")
                .unwrap()
                .unwrap();

            assert_eq!(report.peer, Some(SocketAddr::V4(offender)));
            assert_eq!(report.category, ICMP_DEST_UNREACH);
            assert_eq!(report.code, ICMP_FRAG_NEEDED);
            assert_eq!(report.err, libc::EMSGSIZE);
            assert_eq!(report.mtu_hint(), Some(1400));
            assert_eq!(report.payload, b"snippet");
        }

        #[test]
        fn decode_entry_without_offender() {
            let offender: SocketAddrV4 = "198.51.100.1:0".parse().unwrap();
            let mut data = frag_needed_entry(1400, offender);
            // Strip the trailing offender address entirely.
            data.truncate(mem::size_of::<libc::sock_extended_err>());

            let report = decode_entry(libc::IPPROTO_IP, libc::IP_RECVERR, &data, b"")
                .unwrap()
                .unwrap();
            assert_eq!(report.peer, None);
        }

        #[test]
        fn unrelated_control_message_is_skipped() {
            let decoded =
                decode_entry(libc::SOL_SOCKET, libc::SO_TIMESTAMP, &[0u8; 16], b"").unwrap();
            assert!(decoded.is_none());
        }

        #[test]
        fn truncated_entry_is_malformed() {
            use crate::error::SockError;

            let err = decode_entry(libc::IPPROTO_IP, libc::IP_RECVERR, &[0u8; 4], b"")
                .unwrap_err();
            assert!(matches!(
                err,
                crate::Error::Sock(SockError::MalformedErrQueueEntry { .. })
            ));
        }
    }
}
