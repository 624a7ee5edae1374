//! Java Debug Wire Protocol (JDWP) client for vmbridge.
//!
//! `vmbridge` drives a child JVM running an execution server through this
//! crate. Only the subset of JDWP the controller needs is implemented:
//! handshake, thread and class lookup, static field access, breakpoint and
//! step requests, static method invocation, thread stop, and composite event
//! decoding.

/// Size of the fixed JDWP packet header (length, id, flags, command set/command or error code).
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single JDWP packet. Anything larger is treated as a framing error.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;

pub mod wire;
