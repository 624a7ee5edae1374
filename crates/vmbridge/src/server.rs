//! Names and resolved handles of the execution server running in the child.

use std::collections::HashMap;

use vmbridge_config::ServerConfig;

use crate::{
    error::{BridgeError, Result},
    transport::{ClassRef, DebugTransport, MethodRef, ObjectRef, ThreadRef, TransportError},
};

/// Static entry points of the execution server the controller may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerOp {
    NewLoader,
    LoadClass,
    AddObject,
    RemoveObject,
    SetLibraries,
    RunTestSetUp,
    RunTestMethod,
    SuppressOutput,
    RestoreOutput,
    DisposeWindows,
}

impl ServerOp {
    pub fn method_name(self) -> &'static str {
        match self {
            ServerOp::NewLoader => "newLoader",
            ServerOp::LoadClass => "loadClass",
            ServerOp::AddObject => "addObject",
            ServerOp::RemoveObject => "removeObject",
            ServerOp::SetLibraries => "setLibraries",
            ServerOp::RunTestSetUp => "runTestSetUp",
            ServerOp::RunTestMethod => "runTestMethod",
            ServerOp::SuppressOutput => "suppressOutput",
            ServerOp::RestoreOutput => "restoreOutput",
            ServerOp::DisposeWindows => "disposeWindows",
        }
    }
}

/// Handles resolved once the server reports in. Valid for the lifetime of
/// the channel.
#[derive(Debug, Clone)]
pub(crate) struct ServerHandles {
    pub class: ClassRef,
    pub main: ThreadRef,
    pub worker: ThreadRef,
    /// Preallocated exception thrown into the main thread on a forced exit.
    pub exit_exception: ObjectRef,
}

/// The single method of `class` called `name`.
pub(crate) fn find_unique_method(
    transport: &dyn DebugTransport,
    class: &ClassRef,
    name: &str,
) -> Result<MethodRef> {
    let mut matches = transport
        .methods(class)?
        .into_iter()
        .filter(|method| method.name == name);
    match (matches.next(), matches.next()) {
        (Some(method), None) => Ok(method),
        _ => Err(BridgeError::MissingServerMember(format!("{}.{name}", class.name))),
    }
}

/// Cache of resolved server entry points.
#[derive(Debug, Default)]
pub(crate) struct OpCache {
    methods: HashMap<ServerOp, MethodRef>,
}

impl OpCache {
    pub fn get(&self, op: ServerOp) -> Option<&MethodRef> {
        self.methods.get(&op)
    }

    pub fn insert(&mut self, op: ServerOp, method: MethodRef) {
        self.methods.insert(op, method);
    }
}

/// Looks up the server's threads by name.
pub(crate) fn find_thread(
    transport: &dyn DebugTransport,
    config: &ServerConfig,
    name: &str,
) -> Result<ThreadRef> {
    for thread in transport.all_threads()? {
        match transport.thread_name(thread) {
            Ok(thread_name) if thread_name == name => return Ok(thread),
            Ok(_) => {}
            // A thread may exit between listing and naming it.
            Err(TransportError::Disconnected) => return Err(BridgeError::Disconnected),
            Err(_) => {}
        }
    }
    Err(BridgeError::MissingServerMember(format!(
        "thread {name:?} of {}",
        config.class
    )))
}
