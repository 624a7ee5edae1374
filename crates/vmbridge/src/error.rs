use thiserror::Error;

use crate::{exception::ExceptionDescriptor, transport::TransportError};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The child could not be started or never accepted a debugger connection.
    #[error("failed to launch debuggee: {message}")]
    Launch {
        message: String,
        /// Tail of the child's stderr, if any was captured.
        diagnostics: String,
    },

    #[error("debuggee disconnected")]
    Disconnected,

    /// A call the channel rejected because the target thread was not
    /// suspended, or an invocation whose shape does not match the method.
    #[error("illegal operation: {0}")]
    ProtocolIllegal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("execution server has no unique member `{0}`")]
    MissingServerMember(String),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),

    #[error("{} thrown in debuggee", .0.class_name)]
    RemoteException(Box<ExceptionDescriptor>),

    #[error("timed out waiting for {0} to reach its rendezvous")]
    RendezvousTimeout(String),

    #[error("debuggee has not finished starting")]
    NotReady,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("class {0} is not loaded and could not be loaded")]
    ClassNotFound(String),
    #[error("no code at {class}:{line}")]
    NoCodeAtLine { class: String, line: u32 },
    #[error("no breakpoint at {class}:{line}")]
    NoSuchBreakpoint { class: String, line: u32 },
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => BridgeError::Disconnected,
            TransportError::ThreadNotSuspended(thread) => {
                BridgeError::ProtocolIllegal(format!("thread {thread:#x} is not suspended"))
            }
            TransportError::Rejected(message) => BridgeError::Transport(message),
        }
    }
}

impl BridgeError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BridgeError::Disconnected)
    }
}
