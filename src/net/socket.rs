//! UDP and raw socket construction, and the handle type every I/O primitive
//! operates on.
//!
//! Socket creation is a precondition for the tunnel to run at all, so every
//! failure on these paths is reported as an I/O error the top level treats as
//! fatal. Raw sockets are privileged and platform-restricted; on targets
//! without support, creation fails uniformly with `ProtocolUnsupported`
//! before any resource is allocated.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{SockError, errno};
use crate::net::addr::{self, Family};
use crate::net::filter::FilterProgram;
use crate::net::registry::FdRegistry;
use crate::{Error, Result, info};

/// Transport kind of a socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// Ordinary UDP datagram socket.
    Dgram,
    /// Privileged raw socket carrying a specific transport protocol.
    Raw,
}

/// A socket handle bound to exactly one underlying descriptor.
///
/// Family, kind, and protocol are fixed at creation. The handle stays valid
/// until explicitly closed; any operation afterwards fails with
/// [`SockError::AlreadyClosed`] rather than silently succeeding on a
/// recycled descriptor.
#[derive(Debug)]
pub struct SockFd {
    fd: RawFd,
    family: Family,
    kind: SockKind,
    proto: i32,
    local: SocketAddr,
    device: Option<String>,
    registered: bool,
    closed: bool,
}

impl SockFd {
    /// Returns the underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the address family fixed at creation.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Returns the transport kind fixed at creation.
    pub fn kind(&self) -> SockKind {
        self.kind
    }

    /// Returns the transport-layer protocol number (meaningful for raw
    /// sockets; zero for datagram sockets).
    pub fn proto(&self) -> i32 {
        self.proto
    }

    /// Returns the local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Returns the device the socket is bound to, if any.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Returns `true` if the descriptor is registered for the shutdown
    /// sweep.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Returns `true` once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fails with [`SockError::AlreadyClosed`] once the handle is closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Sock(SockError::AlreadyClosed { fd: self.fd }));
        }
        Ok(())
    }

    /// Closes the descriptor and removes it from the registry.
    ///
    /// Exactly one of this call or the registry sweep retires a descriptor:
    /// if the sweep already closed a registered handle, this reports
    /// [`SockError::AlreadyClosed`] instead of closing a descriptor the OS
    /// may have recycled.
    pub fn close(&mut self, registry: &mut FdRegistry) -> Result<()> {
        self.ensure_open()?;

        if self.registered && !registry.contains(self.fd) {
            self.closed = true;
            return Err(Error::Sock(SockError::AlreadyClosed { fd: self.fd }));
        }

        self.closed = true;
        registry.unregister(self.fd);

        if unsafe { libc::close(self.fd) } == -1 {
            return Err(errno!("failed to close socket fd {}", self.fd));
        }

        Ok(())
    }
}

impl AsRawFd for SockFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Returns `true` if this build can create raw sockets at all.
///
/// The check is resolved per target: call sites get a uniform
/// [`SockError::ProtocolUnsupported`] failure instead of scattered
/// conditional compilation.
pub const fn raw_socket_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Creates and binds a UDP datagram socket.
///
/// Binds to `bind_addr` when given, otherwise to the wildcard address of
/// `family`. With `register_gc` set, the descriptor is registered with
/// `registry` for the shutdown sweep; unregistered handles are the caller's
/// sole responsibility to close.
///
/// # Errors
///
/// Any creation or bind failure is returned as an I/O error; transport setup
/// has no degraded mode, so the top level treats it as fatal.
pub fn udp_sock(
    family: Family,
    port: u16,
    bind_addr: Option<&str>,
    register_gc: bool,
    registry: &mut FdRegistry,
) -> Result<SockFd> {
    let fd = unsafe { libc::socket(family.domain(), libc::SOCK_DGRAM, 0) };
    if fd == -1 {
        return Err(errno!("failed to create {family} UDP socket"));
    }

    let local = match bind_addr {
        Some(text) => addr::resolve(text, port, family),
        None => Ok(addr::wildcard(family, port)),
    };
    let local = match local {
        Ok(local) => local,
        Err(err) => {
            unsafe {
                let _ = libc::close(fd);
            }
            return Err(err);
        }
    };

    let one: libc::c_int = 1;
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &raw const one as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } == -1
    {
        let err = errno!("failed to set SO_REUSEADDR on fd {fd}");
        unsafe {
            let _ = libc::close(fd);
        }
        return Err(err);
    }

    let (sa, len) = addr::to_raw(&local);
    if unsafe { libc::bind(fd, &raw const sa as *const libc::sockaddr, len) } == -1 {
        let err = errno!("failed to bind UDP socket to {local}");
        unsafe {
            let _ = libc::close(fd);
        }
        return Err(err);
    }

    // Re-read the bound address so an ephemeral port request reports the
    // port actually assigned.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getsockname(fd, &raw mut storage as *mut libc::sockaddr, &mut slen) } == -1 {
        let err = errno!("failed to read bound address of fd {fd}");
        unsafe {
            let _ = libc::close(fd);
        }
        return Err(err);
    }
    let local = addr::from_raw(&storage).unwrap_or(local);

    if register_gc {
        registry.register(fd);
    }

    info!("created UDP socket fd {fd} bound to {local}");

    Ok(SockFd {
        fd,
        family,
        kind: SockKind::Dgram,
        proto: 0,
        local,
        device: None,
        registered: register_gc,
        closed: false,
    })
}

/// Creates and binds a raw socket for the given transport protocol.
///
/// When provided, `dev` binds the socket to that device and `bpf` is
/// attached wholly before the socket sees any traffic (the empty program is
/// a passthrough and attaches nothing). `privileged_ns` selects the binding
/// semantics of the constrained multi-tenant namespace, where raw sockets
/// must be bound to their (address, port) pair; outside it the socket is
/// bound to the address alone. The error queue is enabled so ICMP-style
/// notifications can be drained with [`crate::net::drain`].
///
/// # Errors
///
/// Returns [`SockError::ProtocolUnsupported`] on builds without raw-socket
/// support or when the host rejects the protocol; no partial resource is
/// created or registered. Every other creation, bind, or attach failure is
/// an I/O error the top level treats as fatal.
#[cfg(target_os = "linux")]
#[allow(clippy::too_many_arguments)]
pub fn raw_sock(
    family: Family,
    proto: i32,
    port: u16,
    bind_addr: Option<&str>,
    bpf: &FilterProgram,
    dev: Option<&str>,
    privileged_ns: bool,
    register_gc: bool,
    registry: &mut FdRegistry,
) -> Result<SockFd> {
    let fd = unsafe { libc::socket(family.domain(), libc::SOCK_RAW, proto) };
    if fd == -1 {
        let err = io::Error::last_os_error();
        if matches!(
            err.raw_os_error(),
            Some(libc::EPROTONOSUPPORT) | Some(libc::ESOCKTNOSUPPORT)
        ) {
            return Err(Error::Sock(SockError::ProtocolUnsupported { proto }));
        }
        return Err(Error::Io(io::Error::new(
            err.kind(),
            format!("failed to create raw socket for protocol {proto}: {err}"),
        )));
    }

    let local = match raw_sock_setup(fd, family, proto, port, bind_addr, bpf, dev, privileged_ns) {
        Ok(local) => local,
        Err(err) => {
            unsafe {
                let _ = libc::close(fd);
            }
            return Err(err);
        }
    };

    if register_gc {
        registry.register(fd);
    }

    info!(
        "created raw socket fd {fd} (protocol {proto}) bound to {local}{}",
        dev.map(|dev| format!(" on device {dev}"))
            .unwrap_or_default()
    );

    Ok(SockFd {
        fd,
        family,
        kind: SockKind::Raw,
        proto,
        local,
        device: dev.map(String::from),
        registered: register_gc,
        closed: false,
    })
}

/// Device bind, filter attach, error-queue enable, and address bind for a
/// freshly created raw socket. Returns the address the socket was bound to;
/// the caller closes `fd` on any failure so no partially configured
/// descriptor escapes.
#[cfg(target_os = "linux")]
#[allow(clippy::too_many_arguments)]
fn raw_sock_setup(
    fd: RawFd,
    family: Family,
    proto: i32,
    port: u16,
    bind_addr: Option<&str>,
    bpf: &FilterProgram,
    dev: Option<&str>,
    privileged_ns: bool,
) -> Result<SocketAddr> {
    if let Some(dev) = dev {
        // The device name must fit `IFNAMSIZ` including its terminator.
        if dev.len() >= libc::IFNAMSIZ || dev.contains('\0') {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid device name {dev:?}"),
            )));
        }

        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                dev.as_ptr() as *const libc::c_void,
                dev.len() as libc::socklen_t,
            )
        } == -1
        {
            return Err(errno!("failed to bind raw socket fd {fd} to device {dev}"));
        }
    }

    if let Some(fprog) = bpf.as_fprog() {
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &raw const fprog as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        } == -1
        {
            return Err(errno!(
                "failed to attach {}-instruction filter to raw socket fd {fd}",
                bpf.len()
            ));
        }
    }

    // Feed the asynchronous error channel; without this the tunnel never
    // sees path failures such as fragmentation-needed notifications.
    let (level, optname) = match family {
        Family::V4 => (libc::IPPROTO_IP, libc::IP_RECVERR),
        Family::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVERR),
    };
    let one: libc::c_int = 1;
    if unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &raw const one as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } == -1
    {
        return Err(errno!("failed to enable error queue on raw socket fd {fd}"));
    }

    // The constrained namespace demultiplexes raw traffic by port, so the
    // socket must be bound to its (address, port) pair there. A standard
    // host binds the address alone.
    let bind_port = if privileged_ns { port } else { 0 };
    let local = match bind_addr {
        Some(text) => addr::resolve(text, bind_port, family)?,
        None => addr::wildcard(family, bind_port),
    };

    let (sa, len) = addr::to_raw(&local);
    if unsafe { libc::bind(fd, &raw const sa as *const libc::sockaddr, len) } == -1 {
        return Err(errno!(
            "failed to bind raw socket (protocol {proto}) to {local}"
        ));
    }

    Ok(local)
}

/// Creates and binds a raw socket for the given transport protocol.
///
/// This build has no raw-socket support; the call fails immediately with
/// [`SockError::ProtocolUnsupported`] and creates nothing.
#[cfg(not(target_os = "linux"))]
#[allow(clippy::too_many_arguments)]
pub fn raw_sock(
    _family: Family,
    proto: i32,
    _port: u16,
    _bind_addr: Option<&str>,
    _bpf: &FilterProgram,
    _dev: Option<&str>,
    _privileged_ns: bool,
    _register_gc: bool,
    _registry: &mut FdRegistry,
) -> Result<SockFd> {
    Err(Error::Sock(SockError::ProtocolUnsupported { proto }))
}

/// Creates and binds a raw socket capturing TCP, the protocol the tunnel
/// carries over its raw path.
///
/// Equivalent to [`raw_sock`] with `IPPROTO_TCP`.
#[allow(clippy::too_many_arguments)]
pub fn raw_tcp_sock(
    family: Family,
    port: u16,
    bind_addr: Option<&str>,
    bpf: &FilterProgram,
    dev: Option<&str>,
    privileged_ns: bool,
    register_gc: bool,
    registry: &mut FdRegistry,
) -> Result<SockFd> {
    raw_sock(
        family,
        libc::IPPROTO_TCP,
        port,
        bind_addr,
        bpf,
        dev,
        privileged_ns,
        register_gc,
        registry,
    )
}
