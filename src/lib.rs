//! Socket lifecycle and fault-tolerant I/O layer for a user-space UDP tunnel
//! endpoint.
//!
//! This crate provides the transport substrate a tunnel state machine runs
//! on: address and interface resolution, UDP and raw socket construction
//! (with optional packet-filter attachment and device binding), syscall
//! wrappers with a uniform fatal/recoverable failure policy, an error-queue
//! drain that turns ICMP-style notifications into structured reports, and a
//! descriptor registry that guarantees every opened socket is closed exactly
//! once, including on fatal-error exit paths.
//!
//! Tunnel framing, encryption, routing, and retransmission live above this
//! crate and are out of scope.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod error;
pub mod log;
pub mod net;

pub use error::{AddrError, Error, Result, SockError};
