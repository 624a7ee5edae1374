//! Wire-level JDWP implementation.
//!
//! This module speaks the actual JDWP binary protocol over TCP. It is designed
//! to be async-capable (`tokio`) and cancellation-aware.

mod client;
mod codec;
mod poison;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use codec::{class_name_to_signature, method_signature_arity, signature_to_class_name};
pub use types::{
    ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, InvokeReply, JdwpError, JdwpEvent,
    JdwpIdSizes, JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId,
    ReferenceTypeId, ThreadId, ThreadStatus,
};

// The wire-protocol mock server is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
