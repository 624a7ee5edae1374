use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, JdwpReader, JdwpWriter, FLAG_REPLY, HANDSHAKE, HEADER_LEN},
    poison,
    types::{
        ClassInfo, FieldId, FieldInfo, FrameInfo, InvokeReply, JdwpError, JdwpEvent, JdwpIdSizes,
        JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId,
        ReferenceTypeId, Result, ThreadId, ThreadStatus, EVENT_KIND_BREAKPOINT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION, EVENT_KIND_SINGLE_STEP,
        EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH,
        EVENT_KIND_VM_START, EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_COUNT,
        EVENT_MODIFIER_KIND_EXCEPTION_ONLY, EVENT_MODIFIER_KIND_LOCATION_ONLY,
        EVENT_MODIFIER_KIND_STEP, EVENT_MODIFIER_KIND_THREAD_ONLY,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    /// Reply timeout for ordinary commands. `ClassType.InvokeMethod` is never
    /// subject to it because remote code may legitimately run for a long time.
    pub reply_timeout: Duration,
    pub pending_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            pending_channel_size: 256,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type EventSender = mpsc::UnboundedSender<JdwpEvent>;
type EventReceiver = mpsc::UnboundedReceiver<JdwpEvent>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<std::result::Result<Reply, JdwpError>>>>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    /// Dropped by the read loop when the connection ends, which closes the event stream.
    events: std::sync::Mutex<Option<EventSender>>,
    event_rx: std::sync::Mutex<Option<EventReceiver>>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// Asynchronous JDWP client.
///
/// Events are delivered in wire order on a single unbounded stream that ends
/// when the connection closes. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_channel_size)),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events: std::sync::Mutex::new(Some(events_tx)),
            event_rx: std::sync::Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // ID sizes are required for correct parsing of most replies/events.
        let sizes = client.idsizes().await?;
        tracing::debug!(target: "vmbridge.jdwp", ?sizes, %addr, "connected to debuggee");
        let _ = client.capabilities_new().await?;

        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the client is shut down or the connection closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Take the event stream. Only the first caller receives it.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<JdwpEvent>> {
        poison::lock(&self.inner.event_rx, "JdwpClient.take_event_receiver").take()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let timeout = self.inner.config.reply_timeout;
        self.send_command_with_timeout(command_set, command, payload, Some(timeout))
            .await
    }

    async fn send_command_with_timeout(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(&packet).await {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        let wait_reply = async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, rx).await.ok(),
                None => Some(rx.await),
            }
        };

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::Cancelled);
            }
            res = wait_reply => {
                match res {
                    Some(Ok(r)) => r,
                    Some(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    None => {
                        self.remove_pending(id).await;
                        tracing::warn!(
                            target: "vmbridge.jdwp",
                            command_set,
                            command,
                            "JDWP reply timed out"
                        );
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    async fn set_id_sizes(&self, sizes: JdwpIdSizes) {
        *self.inner.id_sizes.lock().await = sizes;
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        self.set_id_sizes(sizes).await;
        Ok(sizes)
    }

    /// VirtualMachine.CapabilitiesNew (1, 17)
    pub async fn capabilities_new(&self) -> Result<Vec<bool>> {
        let payload = self.send_command_raw(1, 17, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let mut caps = Vec::with_capacity(r.remaining());
        while r.remaining() > 0 {
            caps.push(r.read_bool()?);
        }
        Ok(caps)
    }

    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 4, Vec::new()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            threads.push(r.read_object_id(&sizes)?);
        }
        Ok(threads)
    }

    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let payload = self.send_thread_command(11, 1, thread).await?;
        JdwpReader::new(&payload).read_string()
    }

    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.send_thread_command(11, 3, thread).await.map(drop)
    }

    /// ThreadReference.Status (11, 4)
    pub async fn thread_status(&self, thread: ThreadId) -> Result<ThreadStatus> {
        let payload = self.send_thread_command(11, 4, thread).await?;
        let mut r = JdwpReader::new(&payload);
        Ok(ThreadStatus {
            thread_status: r.read_u32()?,
            suspend_status: r.read_u32()?,
        })
    }

    /// ThreadReference.Stop (11, 10): asynchronously throw `throwable` in `thread`.
    pub async fn thread_stop(&self, thread: ThreadId, throwable: ObjectId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_object_id(throwable, &sizes);
        let _ = self.send_command_raw(11, 10, w.into_vec()).await?;
        Ok(())
    }

    async fn send_thread_command(
        &self,
        command_set: u8,
        command: u8,
        thread: ThreadId,
    ) -> Result<Vec<u8>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        self.send_command_raw(command_set, command, w.into_vec())
            .await
    }

    pub async fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);

        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.CreateString (1, 11)
    pub async fn create_string(&self, value: &str) -> Result<ObjectId> {
        let mut w = JdwpWriter::new();
        w.write_string(value);
        let payload = self.send_command_raw(1, 11, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let payload = self.send_reference_type_command(2, 1, class_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.ClassLoader (2, 2). Zero means the bootstrap loader.
    pub async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId> {
        let payload = self.send_reference_type_command(2, 2, class_id).await?;
        let sizes = self.id_sizes().await;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    pub async fn reference_type_fields(&self, class_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let payload = self.send_reference_type_command(2, 4, class_id).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id(sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(fields)
    }

    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let payload = self.send_reference_type_command(2, 5, class_id).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.GetValues (2, 6): static field values.
    pub async fn reference_type_get_values(
        &self,
        class_id: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(2, 6, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    pub async fn reference_type_source_file(&self, class_id: ReferenceTypeId) -> Result<String> {
        let payload = self.send_reference_type_command(2, 7, class_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    async fn send_reference_type_command(
        &self,
        command_set: u8,
        command: u8,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<u8>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        self.send_command_raw(command_set, command, w.into_vec())
            .await
    }

    /// ClassType.Superclass (3, 1). Returns `None` for `java.lang.Object`.
    pub async fn class_type_superclass(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let payload = self.send_reference_type_command(3, 1, class_id).await?;
        let sizes = self.id_sizes().await;
        let superclass = JdwpReader::new(&payload).read_reference_type_id(&sizes)?;
        Ok((superclass != 0).then_some(superclass))
    }

    /// ClassType.InvokeMethod (3, 3)
    ///
    /// Waits for the reply without a timeout: the invoked method runs for as
    /// long as the debuggee needs, and only a disconnect ends the wait early.
    pub async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self
            .send_command_with_timeout(3, 3, w.into_vec(), None)
            .await?;
        let mut r = JdwpReader::new(&payload);
        let return_value = r.read_tagged_value(&sizes)?;
        let (_tag, exception) = r.read_tagged_object_id(&sizes)?;
        Ok(InvokeReply {
            return_value,
            exception: (exception != 0).then_some(exception),
        })
    }

    pub async fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            });
        }
        Ok(LineTable { start, end, lines })
    }

    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    pub async fn object_reference_get_values(
        &self,
        object_id: ObjectId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(9, 2, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(string_id, &sizes);
        let payload = self.send_command_raw(10, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    pub async fn vm_resume(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 9, Vec::new()).await?;
        Ok(())
    }

    pub async fn vm_suspend(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 8, Vec::new()).await?;
        Ok(())
    }

    /// VirtualMachine.Dispose (1, 6). The connection stays open until the peer closes it.
    pub async fn vm_dispose(&self) -> Result<()> {
        let _ = self.send_command_raw(1, 6, Vec::new()).await?;
        Ok(())
    }

    /// EventRequest.Set (15, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        r.read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        let _ = self.send_command_raw(15, 2, w.into_vec()).await?;
        Ok(())
    }

    /// EventRequest.ClearAllBreakpoints (15, 3)
    pub async fn event_request_clear_all_breakpoints(&self) -> Result<()> {
        let _ = self.send_command_raw(15, 3, Vec::new()).await?;
        Ok(())
    }
}

fn read_tagged_values(payload: &[u8], sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>> {
    let mut r = JdwpReader::new(payload);
    let count = r.read_u32()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.read_tagged_value(sizes)?);
    }
    Ok(values)
}

#[derive(Debug, Clone)]
pub enum EventModifier {
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

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(EVENT_MODIFIER_KIND_COUNT);
                w.write_u32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(EVENT_MODIFIER_KIND_THREAD_ONLY);
                w.write_object_id(thread, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_MATCH);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(EVENT_MODIFIER_KIND_LOCATION_ONLY);
                w.write_location(&location, sizes);
            }
            EventModifier::ExceptionOnly {
                exception_or_null,
                caught,
                uncaught,
            } => {
                w.write_u8(EVENT_MODIFIER_KIND_EXCEPTION_ONLY);
                w.write_reference_type_id(exception_or_null, sizes);
                w.write_bool(caught);
                w.write_bool(uncaught);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                w.write_u8(EVENT_MODIFIER_KIND_STEP);
                w.write_object_id(thread, sizes);
                w.write_u32(size);
                w.write_u32(depth);
            }
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut header) => res,
        };
        if let Err(err) = header_read {
            tracing::debug!(target: "vmbridge.jdwp", error = %err, "JDWP connection closed");
            break;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if !(HEADER_LEN..=crate::MAX_JDWP_PACKET_BYTES).contains(&length) {
            tracing::warn!(target: "vmbridge.jdwp", length, "invalid JDWP packet length");
            break;
        }

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let mut payload = vec![0u8; length - HEADER_LEN];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if payload_read.is_err() {
            break;
        }

        if (flags & FLAG_REPLY) != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&id)
            };

            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
        } else {
            let command_set = header[9];
            let command = header[10];
            if command_set == 64 && command == 100 {
                // Composite event packet.
                if let Err(err) = handle_event_packet(&inner, &payload).await {
                    tracing::warn!(target: "vmbridge.jdwp", error = %err, "malformed event packet");
                    break;
                }
            } else {
                tracing::trace!(
                    target: "vmbridge.jdwp",
                    command_set,
                    command,
                    "ignoring unexpected command packet from debuggee"
                );
            }
        }
    }

    inner.shutdown.cancel();
    // Closing the sender ends the event stream for whoever holds the receiver.
    poison::lock(&inner.events, "read_loop.events").take();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

fn publish(inner: &Inner, event: JdwpEvent) {
    if let Some(events) = poison::lock(&inner.events, "publish").as_ref() {
        let _ = events.send(event);
    }
}

async fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_SINGLE_STEP => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_EXCEPTION => {
                let thread = r.read_object_id(&sizes)?;
                let location = r.read_location(&sizes)?;
                let (_tag, exception) = r.read_tagged_object_id(&sizes)?;
                let catch_loc = r.read_location(&sizes)?;
                let catch_location = (catch_loc.class_id != 0 || catch_loc.method_id != 0)
                    .then_some(catch_loc);
                JdwpEvent::Exception {
                    request_id,
                    thread,
                    location,
                    exception,
                    catch_location,
                }
            }
            EVENT_KIND_THREAD_START => JdwpEvent::ThreadStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_THREAD_DEATH => JdwpEvent::ThreadDeath {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(&sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath { request_id },
            other => {
                // Unknown event kind: its layout is unknown, so the rest of the packet is skipped.
                tracing::debug!(target: "vmbridge.jdwp", kind = other, "skipping unknown event kind");
                return Ok(());
            }
        };
        publish(inner, event);
    }
    Ok(())
}
