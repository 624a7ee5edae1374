use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, encode_reply, JdwpReader, JdwpWriter, HANDSHAKE, HEADER_LEN},
    poison,
    types::{
        FieldId, JdwpIdSizes, JdwpValue, Location, MethodId, ObjectId, ReferenceTypeId, Result,
        ThreadId, ERROR_INVALID_CLASS, ERROR_INVALID_METHODID, ERROR_INVALID_OBJECT,
        ERROR_INVALID_THREAD, ERROR_NOT_IMPLEMENTED, EVENT_KIND_BREAKPOINT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION, EVENT_KIND_SINGLE_STEP,
        EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH,
        EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_COUNT,
        EVENT_MODIFIER_KIND_EXCEPTION_ONLY, EVENT_MODIFIER_KIND_LOCATION_ONLY,
        EVENT_MODIFIER_KIND_STEP, EVENT_MODIFIER_KIND_THREAD_ONLY, SUSPEND_POLICY_EVENT_THREAD,
        SUSPEND_POLICY_NONE, SUSPEND_STATUS_SUSPENDED, TAG_OBJECT, TYPE_TAG_CLASS,
    },
};

const FIRST_CREATED_OBJECT_ID: u64 = 0x7000_0000;
const THREAD_STATUS_RUNNING: u32 = 1;

/// A small in-process JDWP server for tests.
///
/// It answers the subset of commands the client issues from a static class
/// and thread model, records the requests it receives, and lets tests push
/// arbitrary events to the connected client.
pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockJdwpServerConfig {
    pub id_sizes: JdwpIdSizes,
    pub capabilities: Vec<bool>,
    /// Live threads, reported by `VirtualMachine.AllThreads` in this order.
    pub threads: Vec<(ThreadId, String)>,
    pub classes: Vec<MockClass>,
    pub objects: Vec<MockObject>,
    pub strings: Vec<(ObjectId, String)>,
    /// Stack frames per thread, innermost first.
    pub frames: Vec<(ThreadId, Vec<Location>)>,
}

impl Default for MockJdwpServerConfig {
    fn default() -> Self {
        Self {
            id_sizes: JdwpIdSizes::default(),
            capabilities: vec![false; 32],
            threads: Vec::new(),
            classes: Vec::new(),
            objects: Vec::new(),
            strings: Vec::new(),
            frames: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockClass {
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub source_file: String,
    pub class_loader: ObjectId,
    /// Zero for a root class.
    pub superclass: ReferenceTypeId,
    pub methods: Vec<MockMethod>,
    pub fields: Vec<MockField>,
}

#[derive(Clone, Debug)]
pub struct MockMethod {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    /// `(code index, source line)` pairs.
    pub lines: Vec<(u64, i32)>,
    pub invoke: MockInvoke,
}

#[derive(Clone, Debug)]
pub enum MockInvoke {
    Return(JdwpValue),
    Throw(ObjectId),
}

#[derive(Clone, Debug)]
pub struct MockField {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub static_value: JdwpValue,
}

#[derive(Clone, Debug)]
pub struct MockObject {
    pub object_id: ObjectId,
    pub class_id: ReferenceTypeId,
    pub fields: Vec<(FieldId, JdwpValue)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: i32,
    pub modifiers: Vec<MockEventRequestModifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEventRequestModifier {
    Count {
        count: u32,
    },
    ThreadOnly {
        thread: ThreadId,
    },
    ClassMatch {
        pattern: String,
    },
    LocationOnly {
        location: Location,
    },
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: u32,
        depth: u32,
    },
}

/// A recorded `ClassType.InvokeMethod` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockInvocation {
    pub class_id: ReferenceTypeId,
    pub thread: ThreadId,
    pub method_id: MethodId,
    pub args: Vec<JdwpValue>,
    pub options: u32,
}

/// An event the test pushes to the client. Request ids and suspend policies
/// are looked up from the requests the client registered where the event
/// does not name one.
#[derive(Debug, Clone)]
pub enum MockEvent {
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
    },
    ClassPrepare {
        thread: ThreadId,
        type_id: ReferenceTypeId,
    },
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    VmDeath,
}

impl MockJdwpServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(Default::default()).await
    }

    pub async fn spawn_with_config(config: MockJdwpServerConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the connection as if the debuggee process died.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    /// Make every subsequent `(command_set, command)` fail with `error_code`.
    pub fn set_reply_error(&self, command_set: u8, command: u8, error_code: u16) {
        poison::lock(&self.state.reply_errors, "MockJdwpServer.set_reply_error")
            .insert((command_set, command), error_code);
    }

    /// Push a single-event composite packet to the connected client.
    pub async fn emit_event(&self, event: MockEvent) {
        let Some(writer) = self.state.writer.lock().await.clone() else {
            return;
        };
        let packet = make_event_packet(&self.state, event).await;
        let mut guard = writer.lock().await;
        let _ = guard.write_all(&packet).await;
    }

    pub async fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.event_requests.lock().await.clone()
    }

    pub async fn invocations(&self) -> Vec<MockInvocation> {
        self.state.invocations.lock().await.clone()
    }

    pub async fn stopped_threads(&self) -> Vec<(ThreadId, ObjectId)> {
        self.state.stopped_threads.lock().await.clone()
    }

    pub async fn suspended_threads(&self) -> BTreeSet<ThreadId> {
        self.state.suspended.lock().await.clone()
    }

    pub fn vm_suspend_calls(&self) -> u32 {
        self.state.vm_suspend_calls.load(Ordering::Relaxed)
    }

    pub fn vm_resume_calls(&self) -> u32 {
        self.state.vm_resume_calls.load(Ordering::Relaxed)
    }

    pub fn thread_resume_calls(&self) -> u32 {
        self.state.thread_resume_calls.load(Ordering::Relaxed)
    }

    pub fn clear_all_breakpoints_calls(&self) -> u32 {
        self.state.clear_all_breakpoints_calls.load(Ordering::Relaxed)
    }

    pub fn dispose_calls(&self) -> u32 {
        self.state.dispose_calls.load(Ordering::Relaxed)
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct State {
    config: MockJdwpServerConfig,
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    next_object_id: AtomicU64,
    vm_suspend_calls: AtomicU32,
    vm_resume_calls: AtomicU32,
    thread_resume_calls: AtomicU32,
    clear_all_breakpoints_calls: AtomicU32,
    dispose_calls: AtomicU32,
    reply_errors: std::sync::Mutex<HashMap<(u8, u8), u16>>,
    writer: tokio::sync::Mutex<Option<SharedWriter>>,
    event_requests: tokio::sync::Mutex<Vec<MockEventRequest>>,
    invocations: tokio::sync::Mutex<Vec<MockInvocation>>,
    stopped_threads: tokio::sync::Mutex<Vec<(ThreadId, ObjectId)>>,
    suspended: tokio::sync::Mutex<BTreeSet<ThreadId>>,
    strings: tokio::sync::Mutex<HashMap<ObjectId, String>>,
}

impl State {
    fn new(config: MockJdwpServerConfig) -> Self {
        let strings = config.strings.iter().cloned().collect();
        Self {
            config,
            next_request_id: AtomicI32::new(1),
            next_packet_id: AtomicU32::new(1),
            next_object_id: AtomicU64::new(FIRST_CREATED_OBJECT_ID),
            vm_suspend_calls: AtomicU32::new(0),
            vm_resume_calls: AtomicU32::new(0),
            thread_resume_calls: AtomicU32::new(0),
            clear_all_breakpoints_calls: AtomicU32::new(0),
            dispose_calls: AtomicU32::new(0),
            reply_errors: std::sync::Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
            event_requests: tokio::sync::Mutex::new(Vec::new()),
            invocations: tokio::sync::Mutex::new(Vec::new()),
            stopped_threads: tokio::sync::Mutex::new(Vec::new()),
            suspended: tokio::sync::Mutex::new(BTreeSet::new()),
            strings: tokio::sync::Mutex::new(strings),
        }
    }

    fn alloc_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reply_error(&self, command_set: u8, command: u8) -> Option<u16> {
        poison::lock(&self.reply_errors, "State.reply_error")
            .get(&(command_set, command))
            .copied()
    }

    fn class(&self, type_id: ReferenceTypeId) -> Option<&MockClass> {
        self.config.classes.iter().find(|c| c.type_id == type_id)
    }

    fn thread_name(&self, thread: ThreadId) -> Option<&str> {
        self.config
            .threads
            .iter()
            .find(|(id, _)| *id == thread)
            .map(|(_, name)| name.as_str())
    }

    async fn request_for_kind(&self, event_kind: u8) -> Option<MockEventRequest> {
        self.event_requests
            .lock()
            .await
            .iter()
            .find(|r| r.event_kind == event_kind)
            .cloned()
    }

    async fn suspend_policy_of(&self, request_id: i32) -> u8 {
        self.event_requests
            .lock()
            .await
            .iter()
            .find(|r| r.request_id == request_id)
            .map(|r| r.suspend_policy)
            .unwrap_or(SUSPEND_POLICY_EVENT_THREAD)
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        accept = listener.accept() => {
            let (mut socket, _) = accept?;

            // Handshake: debugger -> "JDWP-Handshake", server echoes back.
            let mut hs = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut hs).await?;
            if hs != *HANDSHAKE {
                return Ok(());
            }
            socket.write_all(HANDSHAKE).await?;

            let (mut reader, writer) = socket.into_split();
            let writer = Arc::new(tokio::sync::Mutex::new(writer));
            *state.writer.lock().await = Some(writer.clone());

            let result = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    res = read_packet(&mut reader) => {
                        let packet = match res {
                            Ok(Some(packet)) => packet,
                            Ok(None) => break Ok(()),
                            Err(err) => break Err(err),
                        };
                        let reply = handle_packet(&state, packet).await;
                        let mut guard = writer.lock().await;
                        if let Err(err) = guard.write_all(&reply).await {
                            break Err(err);
                        }
                    }
                }
            };

            // Drop every handle on the write half so the client observes EOF.
            state.writer.lock().await.take();
            let _ = writer.lock().await.shutdown().await;
            result
        }
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];
    if flags != 0 {
        // The mock only expects commands from the debugger.
        return Ok(None);
    }
    let command_set = header[9];
    let command = header[10];
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id,
        command_set,
        command,
        payload,
    }))
}

async fn handle_packet(state: &State, packet: Packet) -> Vec<u8> {
    if let Some(code) = state.reply_error(packet.command_set, packet.command) {
        return encode_reply(packet.id, code, &[]);
    }
    match reply_payload(state, &packet).await {
        Ok(Ok(payload)) => encode_reply(packet.id, 0, &payload),
        Ok(Err(code)) => encode_reply(packet.id, code, &[]),
        // Malformed command payloads are answered like unsupported commands.
        Err(_) => encode_reply(packet.id, ERROR_NOT_IMPLEMENTED, &[]),
    }
}

/// Outer error: the command could not be decoded. Inner error: a JDWP error code.
async fn reply_payload(
    state: &State,
    packet: &Packet,
) -> Result<std::result::Result<Vec<u8>, u16>> {
    let sizes = &state.config.id_sizes;
    let mut r = JdwpReader::new(&packet.payload);
    let mut w = JdwpWriter::new();

    match (packet.command_set, packet.command) {
        // VirtualMachine.ClassesBySignature
        (1, 2) => {
            let signature = r.read_string()?;
            let matches: Vec<_> = state
                .config
                .classes
                .iter()
                .filter(|c| c.signature == signature)
                .collect();
            w.write_u32(matches.len() as u32);
            for class in matches {
                w.write_u8(TYPE_TAG_CLASS);
                w.write_reference_type_id(class.type_id, sizes);
                w.write_u32(7); // verified | prepared | initialized
            }
        }
        // VirtualMachine.AllThreads
        (1, 4) => {
            w.write_u32(state.config.threads.len() as u32);
            for (thread, _) in &state.config.threads {
                w.write_object_id(*thread, sizes);
            }
        }
        // VirtualMachine.Dispose
        (1, 6) => {
            state.dispose_calls.fetch_add(1, Ordering::Relaxed);
        }
        // VirtualMachine.IDSizes
        (1, 7) => {
            w.write_u32(sizes.field_id as u32);
            w.write_u32(sizes.method_id as u32);
            w.write_u32(sizes.object_id as u32);
            w.write_u32(sizes.reference_type_id as u32);
            w.write_u32(sizes.frame_id as u32);
        }
        // VirtualMachine.Suspend
        (1, 8) => {
            state.vm_suspend_calls.fetch_add(1, Ordering::Relaxed);
            let mut suspended = state.suspended.lock().await;
            suspended.extend(state.config.threads.iter().map(|(id, _)| *id));
        }
        // VirtualMachine.Resume
        (1, 9) => {
            state.vm_resume_calls.fetch_add(1, Ordering::Relaxed);
            state.suspended.lock().await.clear();
        }
        // VirtualMachine.CreateString
        (1, 11) => {
            let value = r.read_string()?;
            let id = state.next_object_id.fetch_add(1, Ordering::Relaxed);
            state.strings.lock().await.insert(id, value);
            w.write_object_id(id, sizes);
        }
        // VirtualMachine.CapabilitiesNew
        (1, 17) => {
            for cap in &state.config.capabilities {
                w.write_bool(*cap);
            }
        }
        // ReferenceType.*
        (2, command) => {
            let type_id = r.read_reference_type_id(sizes)?;
            let Some(class) = state.class(type_id) else {
                return Ok(Err(ERROR_INVALID_CLASS));
            };
            match command {
                1 => w.write_string(&class.signature),
                2 => w.write_object_id(class.class_loader, sizes),
                4 => {
                    w.write_u32(class.fields.len() as u32);
                    for field in &class.fields {
                        w.write_id(field.field_id, sizes.field_id);
                        w.write_string(&field.name);
                        w.write_string(&field.signature);
                        w.write_u32(0x0008); // static
                    }
                }
                5 => {
                    w.write_u32(class.methods.len() as u32);
                    for method in &class.methods {
                        w.write_id(method.method_id, sizes.method_id);
                        w.write_string(&method.name);
                        w.write_string(&method.signature);
                        w.write_u32(0x0001); // public
                    }
                }
                6 => {
                    let count = r.read_u32()? as usize;
                    w.write_u32(count as u32);
                    for _ in 0..count {
                        let field_id = r.read_id(sizes.field_id)?;
                        let value = class
                            .fields
                            .iter()
                            .find(|f| f.field_id == field_id)
                            .map(|f| f.static_value.clone())
                            .unwrap_or(JdwpValue::Object {
                                tag: TAG_OBJECT,
                                id: 0,
                            });
                        w.write_tagged_value(&value, sizes);
                    }
                }
                7 => w.write_string(&class.source_file),
                _ => return Ok(Err(ERROR_NOT_IMPLEMENTED)),
            }
        }
        // ClassType.Superclass
        (3, 1) => {
            let type_id = r.read_reference_type_id(sizes)?;
            let Some(class) = state.class(type_id) else {
                return Ok(Err(ERROR_INVALID_CLASS));
            };
            w.write_reference_type_id(class.superclass, sizes);
        }
        // ClassType.InvokeMethod
        (3, 3) => {
            let class_id = r.read_reference_type_id(sizes)?;
            let thread = r.read_object_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let arg_count = r.read_u32()? as usize;
            let mut args = Vec::with_capacity(arg_count);
            for _ in 0..arg_count {
                args.push(r.read_tagged_value(sizes)?);
            }
            let options = r.read_u32()?;

            let Some(class) = state.class(class_id) else {
                return Ok(Err(ERROR_INVALID_CLASS));
            };
            if state.thread_name(thread).is_none() {
                return Ok(Err(ERROR_INVALID_THREAD));
            }
            let Some(method) = class.methods.iter().find(|m| m.method_id == method_id) else {
                return Ok(Err(ERROR_INVALID_METHODID));
            };

            state.invocations.lock().await.push(MockInvocation {
                class_id,
                thread,
                method_id,
                args,
                options,
            });

            match &method.invoke {
                MockInvoke::Return(value) => {
                    w.write_tagged_value(value, sizes);
                    w.write_tagged_object_id(TAG_OBJECT, 0, sizes);
                }
                MockInvoke::Throw(exception) => {
                    w.write_tagged_value(&JdwpValue::Void, sizes);
                    w.write_tagged_object_id(TAG_OBJECT, *exception, sizes);
                }
            }
        }
        // Method.LineTable
        (6, 1) => {
            let class_id = r.read_reference_type_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let Some(class) = state.class(class_id) else {
                return Ok(Err(ERROR_INVALID_CLASS));
            };
            let Some(method) = class.methods.iter().find(|m| m.method_id == method_id) else {
                return Ok(Err(ERROR_INVALID_METHODID));
            };
            let start = method.lines.iter().map(|(idx, _)| *idx).min().unwrap_or(0);
            let end = method.lines.iter().map(|(idx, _)| *idx).max().unwrap_or(0);
            w.write_u64(start);
            w.write_u64(end);
            w.write_u32(method.lines.len() as u32);
            for (index, line) in &method.lines {
                w.write_u64(*index);
                w.write_i32(*line);
            }
        }
        // ObjectReference.ReferenceType
        (9, 1) => {
            let object_id = r.read_object_id(sizes)?;
            let Some(object) = state.config.objects.iter().find(|o| o.object_id == object_id)
            else {
                return Ok(Err(ERROR_INVALID_OBJECT));
            };
            w.write_u8(TYPE_TAG_CLASS);
            w.write_reference_type_id(object.class_id, sizes);
        }
        // ObjectReference.GetValues
        (9, 2) => {
            let object_id = r.read_object_id(sizes)?;
            let Some(object) = state.config.objects.iter().find(|o| o.object_id == object_id)
            else {
                return Ok(Err(ERROR_INVALID_OBJECT));
            };
            let count = r.read_u32()? as usize;
            w.write_u32(count as u32);
            for _ in 0..count {
                let field_id = r.read_id(sizes.field_id)?;
                let value = object
                    .fields
                    .iter()
                    .find(|(id, _)| *id == field_id)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(JdwpValue::Object {
                        tag: TAG_OBJECT,
                        id: 0,
                    });
                w.write_tagged_value(&value, sizes);
            }
        }
        // StringReference.Value
        (10, 1) => {
            let object_id = r.read_object_id(sizes)?;
            let strings = state.strings.lock().await;
            let Some(value) = strings.get(&object_id) else {
                return Ok(Err(ERROR_INVALID_OBJECT));
            };
            w.write_string(value);
        }
        // ThreadReference.*
        (11, command) => {
            let thread = r.read_object_id(sizes)?;
            let Some(name) = state.thread_name(thread) else {
                return Ok(Err(ERROR_INVALID_THREAD));
            };
            match command {
                1 => w.write_string(name),
                2 => {
                    state.suspended.lock().await.insert(thread);
                }
                3 => {
                    state.thread_resume_calls.fetch_add(1, Ordering::Relaxed);
                    state.suspended.lock().await.remove(&thread);
                }
                4 => {
                    let suspended = state.suspended.lock().await.contains(&thread);
                    w.write_u32(THREAD_STATUS_RUNNING);
                    w.write_u32(if suspended { SUSPEND_STATUS_SUSPENDED } else { 0 });
                }
                6 => {
                    let start = r.read_i32()?.max(0) as usize;
                    let length = r.read_i32()?;
                    let frames = state
                        .config
                        .frames
                        .iter()
                        .find(|(id, _)| *id == thread)
                        .map(|(_, frames)| frames.as_slice())
                        .unwrap_or(&[]);
                    let frames = frames.get(start..).unwrap_or(&[]);
                    let take = if length < 0 {
                        frames.len()
                    } else {
                        (length as usize).min(frames.len())
                    };
                    w.write_u32(take as u32);
                    for (idx, location) in frames[..take].iter().enumerate() {
                        w.write_id((start + idx + 1) as u64, sizes.frame_id);
                        w.write_location(location, sizes);
                    }
                }
                10 => {
                    let throwable = r.read_object_id(sizes)?;
                    state.stopped_threads.lock().await.push((thread, throwable));
                }
                _ => return Ok(Err(ERROR_NOT_IMPLEMENTED)),
            }
        }
        // EventRequest.Set
        (15, 1) => {
            let event_kind = r.read_u8()?;
            let suspend_policy = r.read_u8()?;
            let modifier_count = r.read_u32()? as usize;
            let mut modifiers = Vec::with_capacity(modifier_count);
            for _ in 0..modifier_count {
                let modifier = match r.read_u8()? {
                    EVENT_MODIFIER_KIND_COUNT => MockEventRequestModifier::Count {
                        count: r.read_u32()?,
                    },
                    EVENT_MODIFIER_KIND_THREAD_ONLY => MockEventRequestModifier::ThreadOnly {
                        thread: r.read_object_id(sizes)?,
                    },
                    EVENT_MODIFIER_KIND_CLASS_MATCH => MockEventRequestModifier::ClassMatch {
                        pattern: r.read_string()?,
                    },
                    EVENT_MODIFIER_KIND_LOCATION_ONLY => MockEventRequestModifier::LocationOnly {
                        location: r.read_location(sizes)?,
                    },
                    EVENT_MODIFIER_KIND_EXCEPTION_ONLY => {
                        MockEventRequestModifier::ExceptionOnly {
                            exception_or_null: r.read_reference_type_id(sizes)?,
                            caught: r.read_bool()?,
                            uncaught: r.read_bool()?,
                        }
                    }
                    EVENT_MODIFIER_KIND_STEP => MockEventRequestModifier::Step {
                        thread: r.read_object_id(sizes)?,
                        size: r.read_u32()?,
                        depth: r.read_u32()?,
                    },
                    _ => return Ok(Err(ERROR_NOT_IMPLEMENTED)),
                };
                modifiers.push(modifier);
            }
            let request_id = state.alloc_request_id();
            state.event_requests.lock().await.push(MockEventRequest {
                event_kind,
                suspend_policy,
                request_id,
                modifiers,
            });
            w.write_i32(request_id);
        }
        // EventRequest.Clear
        (15, 2) => {
            let event_kind = r.read_u8()?;
            let request_id = r.read_i32()?;
            state
                .event_requests
                .lock()
                .await
                .retain(|req| !(req.event_kind == event_kind && req.request_id == request_id));
        }
        // EventRequest.ClearAllBreakpoints
        (15, 3) => {
            state
                .clear_all_breakpoints_calls
                .fetch_add(1, Ordering::Relaxed);
            state
                .event_requests
                .lock()
                .await
                .retain(|req| req.event_kind != EVENT_KIND_BREAKPOINT);
        }
        _ => return Ok(Err(ERROR_NOT_IMPLEMENTED)),
    }

    Ok(Ok(w.into_vec()))
}

async fn make_event_packet(state: &State, event: MockEvent) -> Vec<u8> {
    let sizes = &state.config.id_sizes;
    let mut body = JdwpWriter::new();
    let suspend_policy = match event {
        MockEvent::Breakpoint {
            request_id,
            thread,
            location,
        } => {
            write_located_event(&mut body, sizes, EVENT_KIND_BREAKPOINT, request_id, thread, &location);
            state.suspend_policy_of(request_id).await
        }
        MockEvent::SingleStep {
            request_id,
            thread,
            location,
        } => {
            write_located_event(&mut body, sizes, EVENT_KIND_SINGLE_STEP, request_id, thread, &location);
            state.suspend_policy_of(request_id).await
        }
        MockEvent::Exception {
            request_id,
            thread,
            location,
            exception,
        } => {
            body.write_u8(EVENT_KIND_EXCEPTION);
            body.write_i32(request_id);
            body.write_object_id(thread, sizes);
            body.write_location(&location, sizes);
            body.write_tagged_object_id(TAG_OBJECT, exception, sizes);
            // Uncaught: the catch location is all zeroes.
            body.write_location(
                &Location {
                    type_tag: 0,
                    class_id: 0,
                    method_id: 0,
                    index: 0,
                },
                sizes,
            );
            state.suspend_policy_of(request_id).await
        }
        MockEvent::ClassPrepare { thread, type_id } => {
            let request = state.request_for_kind(EVENT_KIND_CLASS_PREPARE).await;
            let signature = state
                .class(type_id)
                .map(|c| c.signature.clone())
                .unwrap_or_default();
            body.write_u8(EVENT_KIND_CLASS_PREPARE);
            body.write_i32(request.as_ref().map_or(0, |r| r.request_id));
            body.write_object_id(thread, sizes);
            body.write_u8(TYPE_TAG_CLASS);
            body.write_reference_type_id(type_id, sizes);
            body.write_string(&signature);
            body.write_u32(7);
            request.map_or(SUSPEND_POLICY_NONE, |r| r.suspend_policy)
        }
        MockEvent::ThreadStart { thread } => {
            write_thread_event(state, &mut body, EVENT_KIND_THREAD_START, thread).await
        }
        MockEvent::ThreadDeath { thread } => {
            write_thread_event(state, &mut body, EVENT_KIND_THREAD_DEATH, thread).await
        }
        MockEvent::VmDeath => {
            body.write_u8(EVENT_KIND_VM_DEATH);
            body.write_i32(0);
            SUSPEND_POLICY_NONE
        }
    };

    let mut w = JdwpWriter::new();
    w.write_u8(suspend_policy);
    w.write_u32(1); // event count
    let mut payload = w.into_vec();
    payload.extend_from_slice(&body.into_vec());
    encode_command(state.alloc_packet_id(), 64, 100, &payload)
}

fn write_located_event(
    w: &mut JdwpWriter,
    sizes: &JdwpIdSizes,
    kind: u8,
    request_id: i32,
    thread: ThreadId,
    location: &Location,
) {
    w.write_u8(kind);
    w.write_i32(request_id);
    w.write_object_id(thread, sizes);
    w.write_location(location, sizes);
}

async fn write_thread_event(state: &State, w: &mut JdwpWriter, kind: u8, thread: ThreadId) -> u8 {
    let request = state.request_for_kind(kind).await;
    w.write_u8(kind);
    w.write_i32(request.as_ref().map_or(0, |r| r.request_id));
    w.write_object_id(thread, &state.config.id_sizes);
    request.map_or(SUSPEND_POLICY_NONE, |r| r.suspend_policy)
}
