//! Socket creation, registration, and fault-tolerant I/O primitives for the
//! tunnel transport.
//!
//! All blocking happens inside explicitly invoked operations; the readiness
//! wait in [`wait_readable`] is the single suspension point intended for
//! multiplexing many sockets from one control loop.

mod addr;
mod errqueue;
mod filter;
mod io;
mod registry;
mod socket;

pub use addr::{Family, interface_for_local_addr, resolve};
pub use errqueue::{ErrReport, TunnelState, drain};
pub use filter::{FILTER_INSN_SIZE, FilterProgram};
pub use io::{fwrite_all, read, recv_from, send_to, try_recv, wait_readable, write_all};
pub use registry::FdRegistry;
pub use socket::{SockFd, SockKind, raw_sock, raw_socket_supported, raw_tcp_sock, udp_sock};
