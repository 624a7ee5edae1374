//! The debug-control surface the controller drives.
//!
//! [`DebugTransport`] is synchronous: the controller, its dispatcher thread and
//! the gateway all block on it from plain OS threads. [`jdwp::JdwpTransport`]
//! implements it over the JDWP wire client; tests substitute an in-process
//! simulation.

use serde::Serialize;
use thiserror::Error;

use vmbridge_jdwp::wire::{
    method_signature_arity, JdwpValue, MethodId, ObjectId, ReferenceTypeId, ThreadId,
};

pub mod jdwp;

pub use jdwp::JdwpTransport;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The debuggee is gone; nothing sent after this can succeed.
    #[error("debuggee disconnected")]
    Disconnected,
    /// A thread operation required the thread to be suspended and it was not.
    #[error("thread {0:#x} is not suspended")]
    ThreadNotSuspended(ThreadId),
    /// The debuggee rejected the command.
    #[error("{0}")]
    Rejected(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// JDWP request id returned by the event-request commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadRef(pub ThreadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectRef(pub ObjectId);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);
}

/// A loaded class. `loader` is null for the bootstrap loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    pub id: ReferenceTypeId,
    pub name: String,
    pub loader: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class_id: ReferenceTypeId,
    pub id: MethodId,
    pub name: String,
    /// JNI-style signature, e.g. `(Ljava/lang/String;)V`.
    pub signature: String,
}

impl MethodRef {
    pub fn arity(&self) -> Option<usize> {
        method_signature_arity(&self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

/// How much of the debuggee an event request stops when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

/// Whether other threads may run while an invoked method executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokePolicy {
    /// Only the invoking thread runs.
    SingleThreaded,
    /// Every thread is resumed for the duration of the call.
    ResumeAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Returned(JdwpValue),
    Threw(ObjectRef),
}

/// One resolved frame of a suspended thread's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrameDescriptor {
    pub class_name: String,
    pub method_name: String,
    pub source_file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    VmStart {
        thread: ThreadRef,
    },
    Breakpoint {
        request: RequestId,
        thread: ThreadRef,
        location: CodeLocation,
    },
    Step {
        request: RequestId,
        thread: ThreadRef,
        location: CodeLocation,
    },
    /// An exception no frame of `thread` catches.
    Exception {
        request: RequestId,
        thread: ThreadRef,
        location: CodeLocation,
        exception: ObjectRef,
    },
    ClassPrepare {
        request: RequestId,
        thread: ThreadRef,
        class: ClassRef,
    },
    ThreadStart {
        thread: ThreadRef,
    },
    ThreadDeath {
        thread: ThreadRef,
    },
    VmDeath,
}

/// Everything the controller needs from a live debuggee.
///
/// Implementations must be safe to call from several threads at once: the
/// dispatcher consumes events while callers invoke methods and manage
/// breakpoints.
pub trait DebugTransport: Send + Sync {
    /// Blocks until the next event arrives. `Ok(None)` means the event stream
    /// has ended because the debuggee disconnected.
    fn next_event(&self) -> TransportResult<Option<TransportEvent>>;

    fn all_threads(&self) -> TransportResult<Vec<ThreadRef>>;
    fn thread_name(&self, thread: ThreadRef) -> TransportResult<String>;
    fn is_suspended(&self, thread: ThreadRef) -> TransportResult<bool>;
    fn suspend_all(&self) -> TransportResult<()>;
    fn resume_all(&self) -> TransportResult<()>;
    fn resume_thread(&self, thread: ThreadRef) -> TransportResult<()>;
    /// Asynchronously throws `exception` in `thread`.
    fn stop_thread(&self, thread: ThreadRef, exception: ObjectRef) -> TransportResult<()>;
    fn stack_frames(&self, thread: ThreadRef) -> TransportResult<Vec<StackFrameDescriptor>>;

    /// All loaded classes with this binary name, across class loaders.
    fn classes_by_name(&self, name: &str) -> TransportResult<Vec<ClassRef>>;
    fn methods(&self, class: &ClassRef) -> TransportResult<Vec<MethodRef>>;
    fn superclass(&self, class: &ClassRef) -> TransportResult<Option<ClassRef>>;
    fn class_of(&self, object: ObjectRef) -> TransportResult<ClassRef>;
    fn class_name_at(&self, location: &CodeLocation) -> TransportResult<String>;
    /// Value of a static field declared by `class`, or `None` if it declares no such field.
    fn static_field(&self, class: &ClassRef, field: &str) -> TransportResult<Option<JdwpValue>>;
    /// Value of an instance field declared by `class` (not its supertypes).
    fn object_field(
        &self,
        object: ObjectRef,
        class: &ClassRef,
        field: &str,
    ) -> TransportResult<Option<JdwpValue>>;
    fn string_value(&self, string: ObjectRef) -> TransportResult<String>;
    fn create_string(&self, value: &str) -> TransportResult<ObjectRef>;

    /// Every code location in `class` that maps to source line `line`.
    fn line_locations(&self, class: &ClassRef, line: u32) -> TransportResult<Vec<CodeLocation>>;
    /// First executable location of `method`.
    fn method_entry(&self, method: &MethodRef) -> TransportResult<CodeLocation>;

    fn set_breakpoint(
        &self,
        location: &CodeLocation,
        policy: SuspendPolicy,
    ) -> TransportResult<RequestId>;
    fn clear_breakpoint(&self, request: RequestId) -> TransportResult<()>;
    fn clear_all_breakpoints(&self) -> TransportResult<()>;
    /// Requests events for exceptions no frame catches.
    fn request_uncaught_exceptions(&self, policy: SuspendPolicy) -> TransportResult<RequestId>;
    fn request_class_prepare(
        &self,
        class_name: &str,
        policy: SuspendPolicy,
    ) -> TransportResult<RequestId>;
    fn clear_class_prepare(&self, request: RequestId) -> TransportResult<()>;
    /// Subscribes to thread start and death without suspending anything.
    fn request_thread_lifecycle(&self) -> TransportResult<()>;
    /// One-shot line step of `thread`, suspending it when it completes.
    fn request_step(&self, thread: ThreadRef, depth: StepDepth) -> TransportResult<RequestId>;
    fn clear_step(&self, request: RequestId) -> TransportResult<()>;

    /// Invokes a static method on `thread`, which must be suspended at an
    /// event. Blocks until the method returns, with no timeout.
    fn invoke_static(
        &self,
        class: &ClassRef,
        thread: ThreadRef,
        method: &MethodRef,
        args: &[JdwpValue],
        policy: InvokePolicy,
    ) -> TransportResult<InvokeOutcome>;

    /// Closes the channel. Idempotent; never fails.
    fn dispose(&self);
}
