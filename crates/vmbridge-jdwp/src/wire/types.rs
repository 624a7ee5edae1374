use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JdwpError>;

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_THREAD_START: u8 = 6;
pub const EVENT_KIND_THREAD_DEATH: u8 = 7;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const EVENT_MODIFIER_KIND_COUNT: u8 = 1;
pub const EVENT_MODIFIER_KIND_THREAD_ONLY: u8 = 3;
pub const EVENT_MODIFIER_KIND_CLASS_MATCH: u8 = 5;
pub const EVENT_MODIFIER_KIND_LOCATION_ONLY: u8 = 7;
pub const EVENT_MODIFIER_KIND_EXCEPTION_ONLY: u8 = 8;
pub const EVENT_MODIFIER_KIND_STEP: u8 = 10;

pub const INVOKE_SINGLE_THREADED: u32 = 0x01;

pub const STEP_SIZE_LINE: u32 = 1;
pub const STEP_DEPTH_INTO: u32 = 0;
pub const STEP_DEPTH_OVER: u32 = 1;
pub const STEP_DEPTH_OUT: u32 = 2;

pub const TYPE_TAG_CLASS: u8 = 1;

pub const SUSPEND_STATUS_SUSPENDED: u32 = 0x1;

pub const TAG_OBJECT: u8 = b'L';
pub const TAG_STRING: u8 = b's';
pub const TAG_CLASS_OBJECT: u8 = b'c';
pub const TAG_ARRAY: u8 = b'[';

pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_INVALID_METHODID: u16 = 23;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;
pub const ERROR_VM_DEAD: u16 = 112;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP request timed out")]
    Timeout,
    #[error("JDWP request cancelled")]
    Cancelled,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("JDWP command failed with error code {0}")]
    VmError(u16),
}

impl JdwpError {
    /// True when the error means the debuggee is gone and no further command can succeed.
    pub fn is_disconnect(&self) -> bool {
        match self {
            JdwpError::ConnectionClosed | JdwpError::Cancelled => true,
            JdwpError::VmError(code) => *code == ERROR_VM_DEAD,
            JdwpError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True when the debuggee is not (yet) listening for a debugger connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, JdwpError::Io(err) if err.kind() == io::ErrorKind::ConnectionRefused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Any reference value; `tag` is the JDWP tag byte (`L`, `s`, `t`, `[`, ...).
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            JdwpValue::Object { id, .. } if *id != 0 => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

impl LineTable {
    /// Source line for a code index: the entry with the greatest index not past `index`.
    pub fn line_for_index(&self, index: u64) -> Option<u32> {
        self.lines
            .iter()
            .filter(|entry| entry.code_index <= index)
            .max_by_key(|entry| entry.code_index)
            .and_then(|entry| u32::try_from(entry.line).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatus {
    pub thread_status: u32,
    pub suspend_status: u32,
}

impl ThreadStatus {
    pub fn is_suspended(&self) -> bool {
        self.suspend_status & SUSPEND_STATUS_SUSPENDED != 0
    }
}

/// Reply of `ClassType.InvokeMethod`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeReply {
    pub return_value: JdwpValue,
    /// Exception thrown by the invoked method, if any.
    pub exception: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath {
        request_id: i32,
    },
}
