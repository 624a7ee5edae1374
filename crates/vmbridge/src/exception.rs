use serde::Serialize;

use crate::transport::{ClassRef, DebugTransport, ObjectRef, StackFrameDescriptor, ThreadRef};

/// Field of `java.lang.Throwable` holding the message.
const MESSAGE_FIELD: &str = "detailMessage";

/// An exception thrown in the debuggee, captured while its thread was still
/// stopped at the throw site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionDescriptor {
    pub class_name: String,
    pub message: Option<String>,
    /// Innermost frame first. Empty when the stack was no longer available.
    pub stack: Vec<StackFrameDescriptor>,
}

/// Captures what the debuggee knows about `exception`.
///
/// `thread` is the thread stopped at the throw site, if any; without it the
/// stack is left empty. Lookup failures degrade to missing detail rather than
/// an error, since the exception itself has already happened.
pub(crate) fn describe(
    transport: &dyn DebugTransport,
    exception: ObjectRef,
    class: &ClassRef,
    thread: Option<ThreadRef>,
) -> ExceptionDescriptor {
    let stack = match thread {
        Some(thread) => transport.stack_frames(thread).unwrap_or_else(|err| {
            tracing::debug!(target: "vmbridge.dispatch", error = %err, "no stack for exception");
            Vec::new()
        }),
        None => Vec::new(),
    };
    ExceptionDescriptor {
        class_name: class.name.clone(),
        message: message_of(transport, exception, class),
        stack,
    }
}

/// Walks up from `class` to the supertype declaring the message field.
fn message_of(
    transport: &dyn DebugTransport,
    exception: ObjectRef,
    class: &ClassRef,
) -> Option<String> {
    let mut current = Some(class.clone());
    while let Some(class) = current {
        if let Some(value) = transport.object_field(exception, &class, MESSAGE_FIELD).ok()? {
            let string = value.object_id()?;
            return transport.string_value(ObjectRef(string)).ok();
        }
        current = transport.superclass(&class).ok()?;
    }
    None
}

/// How the last run of user code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    NormalExit,
    /// User code asked the process to exit.
    ForcedExit,
    Exception,
    /// The debuggee went away during the run.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub status: ExitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionDescriptor>,
}

/// Outcome bookkeeping for the run in progress.
///
/// A forced exit is sticky: once seen, nothing later in the same run can
/// change the status.
#[derive(Debug, Default)]
pub(crate) struct RunRecord {
    active: bool,
    status: Option<ExitStatus>,
    exception: Option<ExceptionDescriptor>,
}

impl RunRecord {
    pub fn begin(&mut self) {
        *self = RunRecord {
            active: true,
            ..RunRecord::default()
        };
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn forced_exit(&mut self) {
        self.status = Some(ExitStatus::ForcedExit);
        self.exception = None;
    }

    pub fn exception_thrown(&mut self, descriptor: ExceptionDescriptor) {
        if self.status == Some(ExitStatus::ForcedExit) {
            return;
        }
        self.status = Some(ExitStatus::Exception);
        self.exception = Some(descriptor);
    }

    pub fn terminated(&mut self) {
        if self.status.is_none() {
            self.status = Some(ExitStatus::Terminated);
        }
    }

    /// Closes the run. A run nothing else classified ended normally.
    pub fn finish(&mut self) -> RunOutcome {
        self.active = false;
        RunOutcome {
            status: self.status.unwrap_or(ExitStatus::NormalExit),
            exception: self.exception.clone(),
        }
    }
}
