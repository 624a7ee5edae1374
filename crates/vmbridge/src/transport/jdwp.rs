use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Runtime, sync::mpsc};

use vmbridge_config::JdwpConfig;
use vmbridge_jdwp::wire::{
    signature_to_class_name, types, class_name_to_signature, EventModifier, FieldInfo, JdwpClient,
    JdwpClientConfig, JdwpError, JdwpEvent, JdwpValue, LineTable, Location, MethodId, MethodInfo,
    ReferenceTypeId,
};

use super::{
    ClassRef, CodeLocation, DebugTransport, InvokeOutcome, InvokePolicy, MethodRef, ObjectRef,
    RequestId, StackFrameDescriptor, StepDepth, SuspendPolicy, ThreadRef, TransportError,
    TransportEvent, TransportResult,
};

const DISPOSE_TIMEOUT: Duration = Duration::from_millis(500);

impl From<JdwpError> for TransportError {
    fn from(err: JdwpError) -> Self {
        if err.is_disconnect() {
            TransportError::Disconnected
        } else {
            TransportError::Rejected(err.to_string())
        }
    }
}

fn thread_error(err: JdwpError, thread: ThreadRef) -> TransportError {
    match err {
        JdwpError::VmError(types::ERROR_THREAD_NOT_SUSPENDED) => {
            TransportError::ThreadNotSuspended(thread.0)
        }
        other => other.into(),
    }
}

fn policy_byte(policy: SuspendPolicy) -> u8 {
    match policy {
        SuspendPolicy::None => types::SUSPEND_POLICY_NONE,
        SuspendPolicy::EventThread => types::SUSPEND_POLICY_EVENT_THREAD,
        SuspendPolicy::All => types::SUSPEND_POLICY_ALL,
    }
}

fn wire_location(location: &CodeLocation) -> Location {
    Location {
        type_tag: types::TYPE_TAG_CLASS,
        class_id: location.class_id,
        method_id: location.method_id,
        index: location.index,
    }
}

fn code_location(location: Location) -> CodeLocation {
    CodeLocation {
        class_id: location.class_id,
        method_id: location.method_id,
        index: location.index,
    }
}

#[derive(Default)]
struct Caches {
    signatures: HashMap<ReferenceTypeId, String>,
    methods: HashMap<ReferenceTypeId, Vec<MethodInfo>>,
    fields: HashMap<ReferenceTypeId, Vec<FieldInfo>>,
    line_tables: HashMap<(ReferenceTypeId, MethodId), LineTable>,
    source_files: HashMap<ReferenceTypeId, Option<String>>,
}

/// [`DebugTransport`] over a JDWP socket.
///
/// Owns the tokio runtime the wire client lives on; every trait method blocks
/// the calling thread on it.
pub struct JdwpTransport {
    runtime: Runtime,
    client: JdwpClient,
    events: Mutex<mpsc::UnboundedReceiver<JdwpEvent>>,
    caches: Mutex<Caches>,
    disposed: AtomicBool,
}

impl JdwpTransport {
    pub fn connect(addr: SocketAddr, config: &JdwpConfig) -> Result<Self, JdwpError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("vmbridge-jdwp")
            .enable_all()
            .build()?;
        let client_config = JdwpClientConfig {
            handshake_timeout: config.handshake_timeout(),
            reply_timeout: config.reply_timeout(),
            ..JdwpClientConfig::default()
        };
        let client = runtime.block_on(JdwpClient::connect_with_config(addr, client_config))?;
        let events = client.take_event_receiver().ok_or_else(|| {
            JdwpError::Protocol("event stream already taken".to_string())
        })?;
        Ok(Self {
            runtime,
            client,
            events: Mutex::new(events),
            caches: Mutex::new(Caches::default()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Connects to a debuggee that may not be listening yet.
    ///
    /// A refused connection is retried after `backoff`, up to `attempts`
    /// times in total, for as long as `still_running` reports the child alive.
    /// Any other failure is returned immediately.
    pub fn attach_with_retry(
        addr: SocketAddr,
        config: &JdwpConfig,
        attempts: u32,
        backoff: Duration,
        mut still_running: impl FnMut() -> bool,
    ) -> Result<Self, JdwpError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(addr, config) {
                Ok(transport) => {
                    tracing::debug!(target: "vmbridge.jdwp", %addr, attempt, "attached");
                    return Ok(transport);
                }
                Err(err) if err.is_connection_refused() && attempt < attempts => {
                    if !still_running() {
                        return Err(err);
                    }
                    tracing::debug!(
                        target: "vmbridge.jdwp",
                        %addr,
                        attempt,
                        "debuggee not listening yet; retrying"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn signature(&self, class_id: ReferenceTypeId) -> TransportResult<String> {
        if let Some(sig) = self.caches.lock().signatures.get(&class_id) {
            return Ok(sig.clone());
        }
        let sig = self
            .runtime
            .block_on(self.client.reference_type_signature(class_id))?;
        self.caches.lock().signatures.insert(class_id, sig.clone());
        Ok(sig)
    }

    fn class_ref(&self, class_id: ReferenceTypeId) -> TransportResult<ClassRef> {
        let name = signature_to_class_name(&self.signature(class_id)?);
        let loader = self
            .runtime
            .block_on(self.client.reference_type_class_loader(class_id))?;
        Ok(ClassRef {
            id: class_id,
            name,
            loader: ObjectRef(loader),
        })
    }

    fn method_infos(&self, class_id: ReferenceTypeId) -> TransportResult<Vec<MethodInfo>> {
        if let Some(methods) = self.caches.lock().methods.get(&class_id) {
            return Ok(methods.clone());
        }
        let methods = self
            .runtime
            .block_on(self.client.reference_type_methods(class_id))?;
        self.caches.lock().methods.insert(class_id, methods.clone());
        Ok(methods)
    }

    fn field_infos(&self, class_id: ReferenceTypeId) -> TransportResult<Vec<FieldInfo>> {
        if let Some(fields) = self.caches.lock().fields.get(&class_id) {
            return Ok(fields.clone());
        }
        let fields = self
            .runtime
            .block_on(self.client.reference_type_fields(class_id))?;
        self.caches.lock().fields.insert(class_id, fields.clone());
        Ok(fields)
    }

    fn line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> TransportResult<LineTable> {
        let key = (class_id, method_id);
        if let Some(table) = self.caches.lock().line_tables.get(&key) {
            return Ok(table.clone());
        }
        let table = self
            .runtime
            .block_on(self.client.method_line_table(class_id, method_id))?;
        self.caches.lock().line_tables.insert(key, table.clone());
        Ok(table)
    }

    fn source_file(&self, class_id: ReferenceTypeId) -> Option<String> {
        if let Some(file) = self.caches.lock().source_files.get(&class_id) {
            return file.clone();
        }
        // Classes compiled without debug info have no source file attribute.
        let file = self
            .runtime
            .block_on(self.client.reference_type_source_file(class_id))
            .ok();
        self.caches
            .lock()
            .source_files
            .insert(class_id, file.clone());
        file
    }

    fn frame_descriptor(&self, location: Location) -> TransportResult<StackFrameDescriptor> {
        let class_name = signature_to_class_name(&self.signature(location.class_id)?);
        let method_name = self
            .method_infos(location.class_id)?
            .into_iter()
            .find(|m| m.method_id == location.method_id)
            .map(|m| m.name)
            .unwrap_or_else(|| "<unknown>".to_string());
        let line = self
            .line_table(location.class_id, location.method_id)
            .ok()
            .and_then(|table| table.line_for_index(location.index));
        Ok(StackFrameDescriptor {
            class_name,
            method_name,
            source_file: self.source_file(location.class_id),
            line,
        })
    }

    fn translate(&self, event: JdwpEvent) -> TransportResult<TransportEvent> {
        Ok(match event {
            JdwpEvent::VmStart { thread, .. } => TransportEvent::VmStart {
                thread: ThreadRef(thread),
            },
            JdwpEvent::Breakpoint {
                request_id,
                thread,
                location,
            } => TransportEvent::Breakpoint {
                request: RequestId(request_id),
                thread: ThreadRef(thread),
                location: code_location(location),
            },
            JdwpEvent::SingleStep {
                request_id,
                thread,
                location,
            } => TransportEvent::Step {
                request: RequestId(request_id),
                thread: ThreadRef(thread),
                location: code_location(location),
            },
            JdwpEvent::Exception {
                request_id,
                thread,
                location,
                exception,
                ..
            } => TransportEvent::Exception {
                request: RequestId(request_id),
                thread: ThreadRef(thread),
                location: code_location(location),
                exception: ObjectRef(exception),
            },
            JdwpEvent::ClassPrepare {
                request_id,
                thread,
                type_id,
                signature,
                ..
            } => {
                self.caches.lock().signatures.insert(type_id, signature);
                TransportEvent::ClassPrepare {
                    request: RequestId(request_id),
                    thread: ThreadRef(thread),
                    class: self.class_ref(type_id)?,
                }
            }
            JdwpEvent::ThreadStart { thread, .. } => TransportEvent::ThreadStart {
                thread: ThreadRef(thread),
            },
            JdwpEvent::ThreadDeath { thread, .. } => TransportEvent::ThreadDeath {
                thread: ThreadRef(thread),
            },
            JdwpEvent::VmDeath { .. } => TransportEvent::VmDeath,
        })
    }

    fn set_request(
        &self,
        event_kind: u8,
        policy: SuspendPolicy,
        modifiers: Vec<EventModifier>,
    ) -> TransportResult<RequestId> {
        let id = self.runtime.block_on(self.client.event_request_set(
            event_kind,
            policy_byte(policy),
            modifiers,
        ))?;
        Ok(RequestId(id))
    }

    fn clear_request(&self, event_kind: u8, request: RequestId) -> TransportResult<()> {
        self.runtime
            .block_on(self.client.event_request_clear(event_kind, request.0))?;
        Ok(())
    }
}

impl DebugTransport for JdwpTransport {
    fn next_event(&self) -> TransportResult<Option<TransportEvent>> {
        let mut events = self.events.lock();
        let Some(event) = self.runtime.block_on(events.recv()) else {
            return Ok(None);
        };
        drop(events);
        self.translate(event).map(Some)
    }

    fn all_threads(&self) -> TransportResult<Vec<ThreadRef>> {
        let threads = self.runtime.block_on(self.client.all_threads())?;
        Ok(threads.into_iter().map(ThreadRef).collect())
    }

    fn thread_name(&self, thread: ThreadRef) -> TransportResult<String> {
        self.runtime
            .block_on(self.client.thread_name(thread.0))
            .map_err(|err| thread_error(err, thread))
    }

    fn is_suspended(&self, thread: ThreadRef) -> TransportResult<bool> {
        let status = self
            .runtime
            .block_on(self.client.thread_status(thread.0))
            .map_err(|err| thread_error(err, thread))?;
        Ok(status.is_suspended())
    }

    fn suspend_all(&self) -> TransportResult<()> {
        Ok(self.runtime.block_on(self.client.vm_suspend())?)
    }

    fn resume_all(&self) -> TransportResult<()> {
        Ok(self.runtime.block_on(self.client.vm_resume())?)
    }

    fn resume_thread(&self, thread: ThreadRef) -> TransportResult<()> {
        self.runtime
            .block_on(self.client.thread_resume(thread.0))
            .map_err(|err| thread_error(err, thread))
    }

    fn stop_thread(&self, thread: ThreadRef, exception: ObjectRef) -> TransportResult<()> {
        self.runtime
            .block_on(self.client.thread_stop(thread.0, exception.0))
            .map_err(|err| thread_error(err, thread))
    }

    fn stack_frames(&self, thread: ThreadRef) -> TransportResult<Vec<StackFrameDescriptor>> {
        // `length = -1` asks for every frame from `start`.
        let frames = self
            .runtime
            .block_on(self.client.frames(thread.0, 0, -1))
            .map_err(|err| thread_error(err, thread))?;
        frames
            .into_iter()
            .map(|frame| self.frame_descriptor(frame.location))
            .collect()
    }

    fn classes_by_name(&self, name: &str) -> TransportResult<Vec<ClassRef>> {
        let signature = class_name_to_signature(name);
        let classes = self
            .runtime
            .block_on(self.client.classes_by_signature(&signature))?;
        classes
            .into_iter()
            .map(|info| {
                self.caches
                    .lock()
                    .signatures
                    .insert(info.type_id, info.signature.clone());
                self.class_ref(info.type_id)
            })
            .collect()
    }

    fn methods(&self, class: &ClassRef) -> TransportResult<Vec<MethodRef>> {
        Ok(self
            .method_infos(class.id)?
            .into_iter()
            .map(|m| MethodRef {
                class_id: class.id,
                id: m.method_id,
                name: m.name,
                signature: m.signature,
            })
            .collect())
    }

    fn superclass(&self, class: &ClassRef) -> TransportResult<Option<ClassRef>> {
        match self
            .runtime
            .block_on(self.client.class_type_superclass(class.id))?
        {
            Some(id) => self.class_ref(id).map(Some),
            None => Ok(None),
        }
    }

    fn class_of(&self, object: ObjectRef) -> TransportResult<ClassRef> {
        let class_id = self
            .runtime
            .block_on(self.client.object_reference_reference_type(object.0))?;
        self.class_ref(class_id)
    }

    fn class_name_at(&self, location: &CodeLocation) -> TransportResult<String> {
        Ok(signature_to_class_name(&self.signature(location.class_id)?))
    }

    fn static_field(&self, class: &ClassRef, field: &str) -> TransportResult<Option<JdwpValue>> {
        let Some(info) = self
            .field_infos(class.id)?
            .into_iter()
            .find(|f| f.name == field)
        else {
            return Ok(None);
        };
        let values = self
            .runtime
            .block_on(self.client.reference_type_get_values(class.id, &[info.field_id]))?;
        Ok(values.into_iter().next())
    }

    fn object_field(
        &self,
        object: ObjectRef,
        class: &ClassRef,
        field: &str,
    ) -> TransportResult<Option<JdwpValue>> {
        let Some(info) = self
            .field_infos(class.id)?
            .into_iter()
            .find(|f| f.name == field)
        else {
            return Ok(None);
        };
        let values = self
            .runtime
            .block_on(self.client.object_reference_get_values(object.0, &[info.field_id]))?;
        Ok(values.into_iter().next())
    }

    fn string_value(&self, string: ObjectRef) -> TransportResult<String> {
        Ok(self
            .runtime
            .block_on(self.client.string_reference_value(string.0))?)
    }

    fn create_string(&self, value: &str) -> TransportResult<ObjectRef> {
        let id = self.runtime.block_on(self.client.create_string(value))?;
        Ok(ObjectRef(id))
    }

    fn line_locations(&self, class: &ClassRef, line: u32) -> TransportResult<Vec<CodeLocation>> {
        let mut locations = Vec::new();
        for method in self.method_infos(class.id)? {
            // Abstract and native methods have no line table.
            let Ok(table) = self.line_table(class.id, method.method_id) else {
                continue;
            };
            locations.extend(
                table
                    .lines
                    .iter()
                    .filter(|entry| u32::try_from(entry.line).ok() == Some(line))
                    .map(|entry| CodeLocation {
                        class_id: class.id,
                        method_id: method.method_id,
                        index: entry.code_index,
                    }),
            );
        }
        Ok(locations)
    }

    fn method_entry(&self, method: &MethodRef) -> TransportResult<CodeLocation> {
        let table = self.line_table(method.class_id, method.id)?;
        let index = table
            .lines
            .iter()
            .map(|entry| entry.code_index)
            .min()
            .unwrap_or(table.start);
        Ok(CodeLocation {
            class_id: method.class_id,
            method_id: method.id,
            index,
        })
    }

    fn set_breakpoint(
        &self,
        location: &CodeLocation,
        policy: SuspendPolicy,
    ) -> TransportResult<RequestId> {
        self.set_request(
            types::EVENT_KIND_BREAKPOINT,
            policy,
            vec![EventModifier::LocationOnly {
                location: wire_location(location),
            }],
        )
    }

    fn clear_breakpoint(&self, request: RequestId) -> TransportResult<()> {
        self.clear_request(types::EVENT_KIND_BREAKPOINT, request)
    }

    fn clear_all_breakpoints(&self) -> TransportResult<()> {
        Ok(self
            .runtime
            .block_on(self.client.event_request_clear_all_breakpoints())?)
    }

    fn request_uncaught_exceptions(&self, policy: SuspendPolicy) -> TransportResult<RequestId> {
        self.set_request(
            types::EVENT_KIND_EXCEPTION,
            policy,
            vec![EventModifier::ExceptionOnly {
                exception_or_null: 0,
                caught: false,
                uncaught: true,
            }],
        )
    }

    fn request_class_prepare(
        &self,
        class_name: &str,
        policy: SuspendPolicy,
    ) -> TransportResult<RequestId> {
        self.set_request(
            types::EVENT_KIND_CLASS_PREPARE,
            policy,
            vec![EventModifier::ClassMatch {
                pattern: class_name.to_string(),
            }],
        )
    }

    fn clear_class_prepare(&self, request: RequestId) -> TransportResult<()> {
        self.clear_request(types::EVENT_KIND_CLASS_PREPARE, request)
    }

    fn request_thread_lifecycle(&self) -> TransportResult<()> {
        self.set_request(types::EVENT_KIND_THREAD_START, SuspendPolicy::None, Vec::new())?;
        self.set_request(types::EVENT_KIND_THREAD_DEATH, SuspendPolicy::None, Vec::new())?;
        Ok(())
    }

    fn request_step(&self, thread: ThreadRef, depth: StepDepth) -> TransportResult<RequestId> {
        let depth = match depth {
            StepDepth::Into => types::STEP_DEPTH_INTO,
            StepDepth::Over => types::STEP_DEPTH_OVER,
            StepDepth::Out => types::STEP_DEPTH_OUT,
        };
        self.set_request(
            types::EVENT_KIND_SINGLE_STEP,
            SuspendPolicy::EventThread,
            vec![
                EventModifier::Step {
                    thread: thread.0,
                    size: types::STEP_SIZE_LINE,
                    depth,
                },
                EventModifier::Count { count: 1 },
            ],
        )
    }

    fn clear_step(&self, request: RequestId) -> TransportResult<()> {
        self.clear_request(types::EVENT_KIND_SINGLE_STEP, request)
    }

    fn invoke_static(
        &self,
        class: &ClassRef,
        thread: ThreadRef,
        method: &MethodRef,
        args: &[JdwpValue],
        policy: InvokePolicy,
    ) -> TransportResult<InvokeOutcome> {
        let options = match policy {
            InvokePolicy::SingleThreaded => types::INVOKE_SINGLE_THREADED,
            InvokePolicy::ResumeAll => 0,
        };
        let reply = self
            .runtime
            .block_on(self.client.class_type_invoke_method(
                class.id, thread.0, method.id, args, options,
            ))
            .map_err(|err| thread_error(err, thread))?;
        Ok(match reply.exception {
            Some(exception) => InvokeOutcome::Threw(ObjectRef(exception)),
            None => InvokeOutcome::Returned(reply.return_value),
        })
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.client.clone();
        let disposed = self.runtime.block_on(async move {
            tokio::time::timeout(DISPOSE_TIMEOUT, client.vm_dispose()).await
        });
        if let Ok(Err(err)) = disposed {
            tracing::debug!(target: "vmbridge.jdwp", error = %err, "VirtualMachine.Dispose failed");
        }
        self.client.shutdown();
    }
}

impl Drop for JdwpTransport {
    fn drop(&mut self) {
        self.client.shutdown();
    }
}
