//! Launches a child JVM running an execution server and drives it over JDWP.
//!
//! The execution server parks its main and worker threads at a rendezvous
//! breakpoint between requests. [`VmController`] runs code on those threads
//! by invoking static methods while they are parked, tracks how user code
//! ends (normal return, uncaught exception, or a requested exit), and manages
//! user breakpoints across class-loader generations.
//!
//! Everything the controller needs from the debuggee goes through
//! [`transport::DebugTransport`]; [`transport::JdwpTransport`] is the real
//! implementation.

pub mod breakpoints;
pub mod controller;
mod dispatcher;
pub mod error;
pub mod exception;
pub mod gateway;
mod loader;
pub mod owner;
pub mod server;
pub mod state;
pub mod transport;

pub use crate::breakpoints::{BreakpointPurpose, BreakpointRecord};
pub use crate::controller::{ThreadInfo, VmController};
pub use crate::error::{BreakpointError, BridgeError, Result};
pub use crate::exception::{ExceptionDescriptor, ExitStatus, RunOutcome};
pub use crate::gateway::{InvokeArg, Invocation};
pub use crate::owner::{DebuggerOwner, NoopOwner};
pub use crate::server::ServerOp;
pub use crate::state::DebuggeeState;
