//! Textual address resolution and local interface lookup.
//!
//! Translation between [`SocketAddr`] and the raw `sockaddr` layouts used by
//! the syscall boundary also lives here; nothing above this module sees a raw
//! address structure.

use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use crate::error::{AddrError, errno};
use crate::{Error, Result};

/// Address family of a socket or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 (`AF_INET`).
    V4,
    /// IPv6 (`AF_INET6`).
    V6,
}

impl Family {
    /// Returns the family of the given socket address.
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub(crate) fn domain(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Parses a textual address and port into a socket address under the
/// requested family.
///
/// # Errors
///
/// Returns [`AddrError::InvalidAddress`] if the text is malformed or does not
/// belong to `family`.
pub fn resolve(addr: &str, port: u16, family: Family) -> Result<SocketAddr> {
    match family {
        Family::V4 => addr
            .parse::<Ipv4Addr>()
            .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))
            .map_err(|_| {
                Error::Addr(AddrError::InvalidAddress {
                    provided: addr.to_string(),
                    family,
                })
            }),
        Family::V6 => addr
            .parse::<Ipv6Addr>()
            .map(|ip| SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
            .map_err(|_| {
                Error::Addr(AddrError::InvalidAddress {
                    provided: addr.to_string(),
                    family,
                })
            }),
    }
}

/// Returns the name of the local network interface carrying `addr`, or `None`
/// when no interface owns it.
///
/// # Notes
///
/// The address must be the one actually bound to the interface, not a
/// publicly-routable address seen from behind a NAT. No NAT traversal is
/// performed.
///
/// # Errors
///
/// Returns an error only if the interface table itself cannot be enumerated;
/// an unknown address is the `Ok(None)` outcome.
pub fn interface_for_local_addr(addr: IpAddr) -> Result<Option<String>> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();

    if unsafe { libc::getifaddrs(&mut ifap) } == -1 {
        return Err(errno!("failed to enumerate network interfaces"));
    }

    let mut found = None;
    let mut cur = ifap;

    while !cur.is_null() {
        // SAFETY: `cur` is a node of the list returned by `getifaddrs` and
        // the list is not freed until after the walk.
        unsafe {
            let ifa = &*cur;
            cur = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }

            let owned = match (addr, i32::from((*ifa.ifa_addr).sa_family)) {
                (IpAddr::V4(v4), family) if family == libc::AF_INET => {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)) == v4
                }
                (IpAddr::V6(v6), family) if family == libc::AF_INET6 => {
                    let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr) == v6
                }
                _ => false,
            };

            if owned {
                found = Some(CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned());
                break;
            }
        }
    }

    unsafe { libc::freeifaddrs(ifap) };

    Ok(found)
}

/// Returns the wildcard (unspecified) address of `family` with the given
/// port.
pub(crate) fn wildcard(family: Family, port: u16) -> SocketAddr {
    match family {
        Family::V4 => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
        Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
    }
}

/// Converts a socket address into the raw `sockaddr` layout expected by the
/// syscall boundary, returning the storage and its effective length.
pub(crate) fn to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };

            // SAFETY: `sockaddr_storage` is sized and aligned to hold any
            // concrete sockaddr type.
            unsafe {
                ptr::write(&raw mut storage as *mut libc::sockaddr_in, sin);
            }

            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };

            // SAFETY: as above.
            unsafe {
                ptr::write(&raw mut storage as *mut libc::sockaddr_in6, sin6);
            }

            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Reads a socket address back out of raw `sockaddr` storage filled in by the
/// kernel. Returns `None` for families this crate does not speak.
pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        family if family == libc::AF_INET => {
            // SAFETY: the kernel filled the storage with a `sockaddr_in`.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        family if family == libc::AF_INET6 => {
            // SAFETY: the kernel filled the storage with a `sockaddr_in6`.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
