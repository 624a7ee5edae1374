use std::{
    collections::{HashMap, HashSet},
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use vmbridge_config::{BridgeConfig, LaunchConfig, RendezvousConfig, ServerConfig};
use vmbridge_jdwp::wire::JdwpValue;
use vmbridge_process::{DebuggeeProcess, LaunchSpec, SpawnOptions, Terminal};

use crate::{
    breakpoints::{BreakpointPurpose, BreakpointRecord, BreakpointTable},
    dispatcher,
    error::{BreakpointError, BridgeError, Result},
    exception::{self, ExceptionDescriptor, ExitStatus, RunOutcome, RunRecord},
    gateway::{InvokeArg, Invocation},
    loader::LoaderArena,
    owner::DebuggerOwner,
    server::{find_unique_method, OpCache, ServerHandles, ServerOp},
    state::{DebuggeeState, StateMachine, Transition},
    transport::{
        ClassRef, DebugTransport, JdwpTransport, ObjectRef, RequestId, StackFrameDescriptor,
        StepDepth, SuspendPolicy, ThreadRef, TransportError,
    },
};

/// Rendezvous bookkeeping for one server thread.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Park {
    /// Number of times the thread has hit the suspend marker.
    pub seq: u64,
    /// Stopped at the suspend marker and not claimed by a call.
    pub parked: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub state: StateMachine,
    pub started: bool,
    pub startup_error: Option<String>,
    pub disconnected: bool,
    pub server_class: Option<ClassRef>,
    pub handles: Option<ServerHandles>,
    pub markers_installed: bool,
    pub class_prepare_request: Option<RequestId>,
    pub breakpoints: BreakpointTable,
    pub loaders: LoaderArena,
    pub ops: OpCache,
    pub parks: HashMap<ThreadRef, Park>,
    /// Threads currently claimed by a remote call.
    pub busy: HashSet<ThreadRef>,
    pub run: RunRecord,
    /// Set once a run's invocation has returned and the main thread has been
    /// let go to return to its rendezvous.
    pub awaiting_main_park: bool,
    pub steps: HashSet<RequestId>,
    pub last_status: Option<ExitStatus>,
    pub last_exception: Option<ExceptionDescriptor>,
}

/// State shared by the controller, the dispatcher thread and in-flight calls.
pub(crate) struct Shared {
    pub transport: Arc<dyn DebugTransport>,
    pub server: ServerConfig,
    pub rendezvous: RendezvousConfig,
    pub owner: Arc<dyn DebuggerOwner>,
    pub inner: Mutex<Inner>,
    pub cond: Condvar,
    /// Serializes compound breakpoint-table updates: set, clear and the
    /// restore after a loader change.
    pub breakpoint_lock: Mutex<()>,
}

impl Shared {
    pub fn state(&self) -> DebuggeeState {
        self.inner.lock().state.current()
    }

    pub fn set_state(&self, to: DebuggeeState) {
        let transition = self.inner.lock().state.transition(to);
        self.report(transition);
    }

    /// Tells the owner about a transition. Must be called without the lock.
    pub fn report(&self, transition: Option<Transition>) {
        if let Some(Transition { old, new }) = transition {
            tracing::info!(target: "vmbridge.controller", %old, %new, "debuggee state changed");
            self.owner.state_changed(old, new);
        }
    }

    pub fn handles(&self) -> Result<ServerHandles> {
        let inner = self.inner.lock();
        match &inner.handles {
            Some(handles) => Ok(handles.clone()),
            None if inner.disconnected => Err(BridgeError::Disconnected),
            None => Err(BridgeError::NotReady),
        }
    }

    /// Blocks until `ready` holds, in slices of the configured wait slice so
    /// a disconnect or the deadline is noticed even without a wakeup.
    pub fn wait_until(
        &self,
        what: &str,
        timeout: Option<Duration>,
        mut ready: impl FnMut(&Inner) -> bool,
    ) -> Result<MutexGuard<'_, Inner>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let slice = self.rendezvous.wait_slice();
        let mut inner = self.inner.lock();
        loop {
            if ready(&inner) {
                return Ok(inner);
            }
            if inner.disconnected {
                return Err(BridgeError::Disconnected);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(BridgeError::RendezvousTimeout(what.to_string()));
            }
            self.cond.wait_for(&mut inner, slice);
        }
    }

    /// The channel is gone: terminate, finish any run, release all waiters.
    pub fn mark_disconnected(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.disconnected = true;
            if inner.run.is_active() {
                inner.run.terminated();
            }
            let transition = inner.state.transition(DebuggeeState::Terminated);
            self.cond.notify_all();
            transition
        };
        self.report(transition);
    }

    fn subscribe(&self) -> Result<()> {
        self.transport
            .request_uncaught_exceptions(SuspendPolicy::EventThread)?;
        let request = self
            .transport
            .request_class_prepare(&self.server.class, SuspendPolicy::All)?;
        self.inner.lock().class_prepare_request = Some(request);
        self.transport.request_thread_lifecycle()?;

        let loaded = self.transport.classes_by_name(&self.server.class)?;
        if let Some(class) = loaded.into_iter().next() {
            self.install_markers_once(&class)?;
        }
        self.transport.resume_all()?;
        Ok(())
    }

    /// Installs the rendezvous markers the first time the server class is seen.
    pub fn install_markers_once(&self, class: &ClassRef) -> Result<()> {
        let request = {
            let mut inner = self.inner.lock();
            if inner.markers_installed {
                return Ok(());
            }
            inner.markers_installed = true;
            inner.class_prepare_request.take()
        };
        if let Some(request) = request {
            if let Err(err) = self.transport.clear_class_prepare(request) {
                tracing::debug!(target: "vmbridge.breakpoints", error = %err, "could not clear class prepare request");
            }
        }
        self.install_markers(class)
    }

    fn install_markers(&self, class: &ClassRef) -> Result<()> {
        let markers = [
            (BreakpointPurpose::Started, &self.server.started_method),
            (BreakpointPurpose::Suspend, &self.server.suspend_method),
            (BreakpointPurpose::ExitMarker, &self.server.exit_marker_method),
        ];
        for (purpose, method_name) in markers {
            let method = find_unique_method(&*self.transport, class, method_name)?;
            let location = self.transport.method_entry(&method)?;
            let request = self
                .transport
                .set_breakpoint(&location, purpose.suspend_policy())?;
            tracing::debug!(
                target: "vmbridge.breakpoints",
                method = %method_name,
                request = request.0,
                "installed marker"
            );
            self.inner.lock().breakpoints.insert(BreakpointRecord {
                request,
                location,
                purpose,
            });
        }
        self.inner.lock().server_class = Some(class.clone());
        Ok(())
    }

    fn set_user_breakpoint(&self, class: &ClassRef, line: u32) -> Result<()> {
        let location = self
            .transport
            .line_locations(class, line)?
            .into_iter()
            .next()
            .ok_or_else(|| BreakpointError::NoCodeAtLine {
                class: class.name.clone(),
                line,
            })?;
        let purpose = BreakpointPurpose::User {
            class: class.name.clone(),
            line,
        };
        let request = self
            .transport
            .set_breakpoint(&location, purpose.suspend_policy())?;
        self.inner.lock().breakpoints.insert(BreakpointRecord {
            request,
            location,
            purpose,
        });
        Ok(())
    }

    /// Clears every breakpoint and puts back the markers plus whichever user
    /// breakpoints still resolve. The debuggee must be suspended.
    fn reinstall_breakpoints(&self, saved: &[(ClassRef, u32)]) -> Result<()> {
        let handles = self.handles()?;
        self.transport.clear_all_breakpoints()?;
        self.inner.lock().breakpoints.clear();
        self.install_markers(&handles.class)?;
        for (class, line) in saved {
            match self.set_user_breakpoint(class, *line) {
                Ok(()) => {}
                Err(BridgeError::Disconnected) => return Err(BridgeError::Disconnected),
                Err(err) => tracing::warn!(
                    target: "vmbridge.breakpoints",
                    class = %class.name,
                    line,
                    error = %err,
                    "dropping breakpoint that no longer resolves"
                ),
            }
        }
        Ok(())
    }
}

/// A thread of the debuggee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub thread: ThreadRef,
    pub name: String,
    pub suspended: bool,
}

/// Drives a debuggee JVM running the execution server.
///
/// All methods take `&self`; share the controller in an `Arc` to call it
/// from several threads. Calls that need the main thread and calls that need
/// the worker thread proceed independently.
pub struct VmController {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    process: Mutex<Option<DebuggeeProcess>>,
}

impl VmController {
    /// Starts the debuggee, attaches to it and begins startup.
    ///
    /// Returns once the channel is up; use [`VmController::wait_for_startup`]
    /// to wait for the execution server to report in.
    pub fn launch(
        config: &BridgeConfig,
        cwd: &Path,
        terminal: Arc<dyn Terminal>,
        owner: Arc<dyn DebuggerOwner>,
    ) -> Result<Self> {
        let spec = LaunchSpec {
            cwd: cwd.to_path_buf(),
            java: config.launch.java.clone(),
            classpath: config.launch.classpath.clone(),
            vm_options: config.launch.vm_options.clone(),
            debug_address: config.launch.debug_address(),
            server_class: config.server.class.clone(),
            interpreted_only: config.launch.interpreted_only,
        };
        let command = spec.command();
        tracing::info!(target: "vmbridge.process", %command, "launching debuggee");

        let options = SpawnOptions {
            diagnostic_bytes: config.launch.diagnostic_bytes,
            ..SpawnOptions::default()
        };
        let mut process =
            DebuggeeProcess::spawn(&command, terminal, options).map_err(|err| {
                BridgeError::Launch {
                    message: err.to_string(),
                    diagnostics: String::new(),
                }
            })?;

        let addr = debug_socket_addr(&config.launch)?;
        let attached = JdwpTransport::attach_with_retry(
            addr,
            &config.jdwp,
            config.launch.attach_attempts,
            config.launch.attach_backoff(),
            || matches!(process.try_wait(), Ok(None)),
        );
        let transport = match attached {
            Ok(transport) => transport,
            Err(err) => {
                let message = match process.try_wait() {
                    Ok(Some(status)) => {
                        format!("debuggee exited ({status}) before accepting a debugger")
                    }
                    _ => format!("could not attach to debuggee at {addr}: {err}"),
                };
                if let Err(err) = process.terminate() {
                    tracing::warn!(target: "vmbridge.process", error = %err, "failed to kill debuggee");
                }
                let diagnostics = process.stderr_tail();
                tracing::error!(target: "vmbridge.process", %message, "launch failed");
                return Err(BridgeError::Launch {
                    message,
                    diagnostics,
                });
            }
        };

        let controller = Self::with_transport(
            Arc::new(transport),
            &config.server,
            &config.rendezvous,
            owner,
        )?;
        *controller.process.lock() = Some(process);
        Ok(controller)
    }

    /// Drives an already-connected transport. The debuggee must be suspended
    /// before its execution server class has run.
    pub fn with_transport(
        transport: Arc<dyn DebugTransport>,
        server: &ServerConfig,
        rendezvous: &RendezvousConfig,
        owner: Arc<dyn DebuggerOwner>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            transport,
            server: server.clone(),
            rendezvous: rendezvous.clone(),
            owner,
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            breakpoint_lock: Mutex::new(()),
        });
        let dispatcher = dispatcher::spawn(shared.clone()).map_err(|err| {
            BridgeError::Transport(format!("failed to start event dispatcher: {err}"))
        })?;
        let controller = Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
            process: Mutex::new(None),
        };
        controller.shared.subscribe()?;
        Ok(controller)
    }

    /// Blocks until the execution server has started and its handles are
    /// resolved.
    pub fn wait_for_startup(&self) -> Result<()> {
        let inner = self.shared.wait_until(
            "execution server startup",
            self.shared.rendezvous.startup_timeout(),
            |inner| inner.started,
        )?;
        match &inner.startup_error {
            Some(message) => Err(BridgeError::MissingServerMember(message.clone())),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> DebuggeeState {
        self.shared.state()
    }

    /// How the most recent completed run ended.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.inner.lock().last_status
    }

    /// The most recent uncaught exception seen in the debuggee.
    pub fn last_exception(&self) -> Option<ExceptionDescriptor> {
        self.shared.inner.lock().last_exception.clone()
    }

    /// Invokes an execution-server operation on the worker thread.
    pub fn invoke_server(
        &self,
        op: ServerOp,
        args: Vec<InvokeArg>,
        propagate_exception: bool,
    ) -> Result<Invocation> {
        self.shared.invoke_on_worker(op, args, propagate_exception)
    }

    /// Runs a shell class on the main thread and reports how it ended.
    pub fn run_shell_class(&self, class_name: &str) -> Result<RunOutcome> {
        self.shared.run_shell_class(class_name)
    }

    /// Replaces the user class loader. User breakpoints set under the old
    /// loader are moved onto the classes the new loader defines; those that
    /// no longer resolve are dropped.
    pub fn new_class_loader(&self, classpath: &[PathBuf]) -> Result<ObjectRef> {
        let classpath = join_classpath(classpath)?;
        let _guard = self.shared.breakpoint_lock.lock();
        let saved = self.shared.inner.lock().breakpoints.user_breakpoints();

        let returned = self.server_call(ServerOp::NewLoader, vec![classpath.into()])?;
        let loader = returned.object_id().map(ObjectRef).ok_or_else(|| {
            BridgeError::ProtocolIllegal("newLoader returned no loader".to_string())
        })?;
        let generation = self.shared.inner.lock().loaders.begin_generation(loader);
        tracing::info!(target: "vmbridge.controller", generation, "new class loader");

        // Load every class that had a breakpoint while the worker can still
        // run; the reinstall below happens with everything suspended.
        let mut reload = Vec::with_capacity(saved.len());
        for (class, line) in saved {
            match self.shared.load_class(&class) {
                Ok(class) => reload.push((class, line)),
                Err(BridgeError::Disconnected) => return Err(BridgeError::Disconnected),
                Err(err) => tracing::warn!(
                    target: "vmbridge.breakpoints",
                    class = %class,
                    line,
                    error = %err,
                    "dropping breakpoint in class the new loader cannot load"
                ),
            }
        }

        self.shared.transport.suspend_all()?;
        let reinstalled = self.shared.reinstall_breakpoints(&reload);
        let resumed = self.shared.transport.resume_all();
        reinstalled?;
        resumed?;
        Ok(loader)
    }

    pub fn load_class(&self, name: &str) -> Result<ClassRef> {
        self.shared.load_class(name)
    }

    /// Binds `object` to `name` in the server's object scope `scope`.
    pub fn add_object(&self, scope: &str, name: &str, object: ObjectRef) -> Result<()> {
        self.server_call(
            ServerOp::AddObject,
            vec![scope.into(), name.into(), object.into()],
        )
        .map(drop)
    }

    pub fn remove_object(&self, scope: &str, name: &str) -> Result<()> {
        self.server_call(ServerOp::RemoveObject, vec![scope.into(), name.into()])
            .map(drop)
    }

    pub fn set_libraries(&self, classpath: &[PathBuf]) -> Result<()> {
        let classpath = join_classpath(classpath)?;
        self.server_call(ServerOp::SetLibraries, vec![classpath.into()])
            .map(drop)
    }

    /// Runs a test class's fixture set-up. Returns what the server reports
    /// about the created fixture objects.
    pub fn run_test_setup(&self, class: &str) -> Result<JdwpValue> {
        self.server_call(ServerOp::RunTestSetUp, vec![class.into()])
    }

    pub fn run_test_method(&self, class: &str, method: &str) -> Result<JdwpValue> {
        self.server_call(ServerOp::RunTestMethod, vec![class.into(), method.into()])
    }

    pub fn suppress_output(&self) -> Result<()> {
        self.server_call(ServerOp::SuppressOutput, Vec::new())
            .map(drop)
    }

    pub fn restore_output(&self) -> Result<()> {
        self.server_call(ServerOp::RestoreOutput, Vec::new())
            .map(drop)
    }

    pub fn dispose_windows(&self) -> Result<()> {
        self.server_call(ServerOp::DisposeWindows, Vec::new())
            .map(drop)
    }

    /// Calls a server operation and turns a thrown exception into an error.
    fn server_call(&self, op: ServerOp, args: Vec<InvokeArg>) -> Result<JdwpValue> {
        match self.shared.invoke_on_worker(op, args, true)? {
            Invocation::Returned(value) => Ok(value),
            Invocation::Threw(thrown) => {
                let class = self.shared.transport.class_of(thrown)?;
                let descriptor = exception::describe(&*self.shared.transport, thrown, &class, None);
                Err(BridgeError::RemoteException(Box::new(descriptor)))
            }
            Invocation::Reported => Err(BridgeError::ProtocolIllegal(format!(
                "{} threw without reporting the exception",
                op.method_name()
            ))),
        }
    }

    /// Reads a static field declared by `class`, loading the class if needed.
    /// `None` when the class declares no such field.
    pub fn get_static_value(&self, class: &str, field: &str) -> Result<Option<JdwpValue>> {
        let class_ref = self.shared.load_class(class)?;
        Ok(self.shared.transport.static_field(&class_ref, field)?)
    }

    /// Sets a breakpoint at `class:line`, loading the class if needed.
    pub fn set_breakpoint(&self, class: &str, line: u32) -> Result<()> {
        let _guard = self.shared.breakpoint_lock.lock();
        let class_ref = match self.shared.load_class(class) {
            Ok(class_ref) => class_ref,
            Err(BridgeError::ClassNotFound(_)) => {
                return Err(BreakpointError::ClassNotFound(class.to_string()).into())
            }
            Err(err) => return Err(err),
        };
        self.shared.set_user_breakpoint(&class_ref, line)?;
        tracing::debug!(target: "vmbridge.breakpoints", class, line, "breakpoint set");
        Ok(())
    }

    /// Removes every breakpoint at `class:line`.
    pub fn clear_breakpoint(&self, class: &str, line: u32) -> Result<()> {
        let _guard = self.shared.breakpoint_lock.lock();
        let removed = self.shared.inner.lock().breakpoints.take_user(class, line);
        if removed.is_empty() {
            return Err(BreakpointError::NoSuchBreakpoint {
                class: class.to_string(),
                line,
            }
            .into());
        }
        let mut removed = removed.into_iter();
        while let Some(record) = removed.next() {
            if let Err(err) = self.shared.transport.clear_breakpoint(record.request) {
                // Whatever is still live on the debuggee stays in the table.
                let mut inner = self.shared.inner.lock();
                inner.breakpoints.insert(record);
                for rest in removed {
                    inner.breakpoints.insert(rest);
                }
                return Err(err.into());
            }
        }
        tracing::debug!(target: "vmbridge.breakpoints", class, line, "breakpoint cleared");
        Ok(())
    }

    /// User breakpoints as `(class, line)` pairs.
    pub fn user_breakpoints(&self) -> Vec<(String, u32)> {
        self.shared.inner.lock().breakpoints.user_breakpoints()
    }

    /// Every breakpoint request the controller owns, markers included.
    pub fn breakpoints(&self) -> Vec<BreakpointRecord> {
        self.shared
            .inner
            .lock()
            .breakpoints
            .records()
            .cloned()
            .collect()
    }

    pub fn dump_breakpoints(&self) {
        for record in self.breakpoints() {
            tracing::debug!(
                target: "vmbridge.breakpoints",
                request = record.request.0,
                purpose = ?record.purpose,
                class_id = record.location.class_id,
                method_id = record.location.method_id,
                index = record.location.index,
                "breakpoint"
            );
        }
    }

    pub fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        let transport = &*self.shared.transport;
        let mut out = Vec::new();
        for thread in transport.all_threads()? {
            // A thread may die between listing and inspection.
            let name = match transport.thread_name(thread) {
                Ok(name) => name,
                Err(TransportError::Disconnected) => return Err(BridgeError::Disconnected),
                Err(_) => "<exited>".to_string(),
            };
            let suspended = match transport.is_suspended(thread) {
                Ok(suspended) => suspended,
                Err(TransportError::Disconnected) => return Err(BridgeError::Disconnected),
                Err(_) => false,
            };
            out.push(ThreadInfo {
                thread,
                name,
                suspended,
            });
        }
        Ok(out)
    }

    /// Frames of a suspended thread, innermost first.
    pub fn thread_stack(&self, thread: ThreadRef) -> Result<Vec<StackFrameDescriptor>> {
        Ok(self.shared.transport.stack_frames(thread)?)
    }

    pub fn dump_threads(&self) -> Result<()> {
        for info in self.list_threads()? {
            tracing::debug!(
                target: "vmbridge.controller",
                thread = info.thread.0,
                name = %info.name,
                suspended = info.suspended,
                "thread"
            );
        }
        Ok(())
    }

    /// Lets a thread stopped at a user breakpoint continue.
    pub fn resume_thread(&self, thread: ThreadRef) -> Result<()> {
        if self.state() == DebuggeeState::Suspended {
            self.shared.set_state(DebuggeeState::Running);
        }
        Ok(self.shared.transport.resume_thread(thread)?)
    }

    /// Steps a thread stopped at a user breakpoint by one line.
    pub fn step(&self, thread: ThreadRef, depth: StepDepth) -> Result<()> {
        let request = self.shared.transport.request_step(thread, depth)?;
        self.shared.inner.lock().steps.insert(request);
        self.resume_thread(thread)
    }

    pub fn suspend_all(&self) -> Result<()> {
        Ok(self.shared.transport.suspend_all()?)
    }

    pub fn resume_all(&self) -> Result<()> {
        Ok(self.shared.transport.resume_all()?)
    }

    /// Disconnects and kills the debuggee. Idempotent.
    pub fn close(&self) {
        self.shared.transport.dispose();
        if let Some(mut process) = self.process.lock().take() {
            match process.terminate() {
                Ok(status) => {
                    tracing::debug!(target: "vmbridge.process", %status, "debuggee terminated")
                }
                Err(err) => {
                    tracing::warn!(target: "vmbridge.process", error = %err, "failed to kill debuggee")
                }
            }
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            // An owner callback may close the controller from the dispatcher itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(target: "vmbridge.dispatch", "event dispatcher panicked");
            }
        }
        self.shared.mark_disconnected();
    }
}

impl Drop for VmController {
    fn drop(&mut self) {
        self.close();
    }
}

fn debug_socket_addr(launch: &LaunchConfig) -> Result<SocketAddr> {
    let address = launch.debug_address();
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BridgeError::Launch {
            message: format!("cannot resolve debug address {address}"),
            diagnostics: String::new(),
        })
}

fn join_classpath(entries: &[PathBuf]) -> Result<String> {
    let joined = std::env::join_paths(entries)
        .map_err(|err| BridgeError::InvalidArgument(format!("invalid classpath: {err}")))?;
    joined.into_string().map_err(|raw| {
        BridgeError::InvalidArgument(format!("classpath is not valid UTF-8: {raw:?}"))
    })
}
