//! Remote invocation on the execution server's parked threads.
//!
//! A call claims a thread that is parked at the rendezvous breakpoint, invokes
//! a static method on it, then lets it run back to the rendezvous and waits
//! for it to park again before returning. Concurrent calls on the same thread
//! queue behind each other; calls on the main and worker threads may overlap.

use vmbridge_jdwp::wire::{types::TAG_OBJECT, types::TAG_STRING, JdwpValue};

use crate::{
    controller::Shared,
    error::{BridgeError, Result},
    exception::{self, ExceptionDescriptor, RunOutcome},
    server::{find_unique_method, ServerOp},
    state::DebuggeeState,
    transport::{
        ClassRef, InvokeOutcome, InvokePolicy, MethodRef, ObjectRef, ThreadRef, TransportError,
    },
};

/// Name of the static entry point every shell class provides.
const SHELL_ENTRY: &str = "run";

/// An argument to a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeArg {
    /// Created as a string in the debuggee before the call.
    Str(String),
    /// A reference that already lives in the debuggee. Primitives are rejected.
    Value(JdwpValue),
}

impl From<&str> for InvokeArg {
    fn from(value: &str) -> Self {
        InvokeArg::Str(value.to_string())
    }
}

impl From<String> for InvokeArg {
    fn from(value: String) -> Self {
        InvokeArg::Str(value)
    }
}

impl From<ObjectRef> for InvokeArg {
    fn from(object: ObjectRef) -> Self {
        InvokeArg::Value(JdwpValue::Object {
            tag: TAG_OBJECT,
            id: object.0,
        })
    }
}

/// Result of a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(JdwpValue),
    /// The method threw and the caller asked to see the exception.
    Threw(ObjectRef),
    /// The method threw and the exception was left to the exception-event
    /// path; see [`crate::VmController::last_exception`].
    Reported,
}

impl Shared {
    /// Resolves a server entry point, once per channel.
    pub(crate) fn resolve_op(&self, op: ServerOp) -> Result<MethodRef> {
        if let Some(method) = self.inner.lock().ops.get(op) {
            return Ok(method.clone());
        }
        let handles = self.handles()?;
        let method = find_unique_method(&*self.transport, &handles.class, op.method_name())?;
        self.inner.lock().ops.insert(op, method.clone());
        Ok(method)
    }

    fn marshal(&self, method: &MethodRef, args: Vec<InvokeArg>) -> Result<Vec<JdwpValue>> {
        let arity = method.arity().ok_or_else(|| {
            BridgeError::ProtocolIllegal(format!(
                "unparseable signature {} for {}",
                method.signature, method.name
            ))
        })?;
        if arity != args.len() {
            tracing::error!(
                target: "vmbridge.gateway",
                method = %method.name,
                expected = arity,
                actual = args.len(),
                "argument count mismatch"
            );
            return Err(BridgeError::ProtocolIllegal(format!(
                "{} takes {arity} argument(s), got {}",
                method.name,
                args.len()
            )));
        }
        args.into_iter()
            .map(|arg| match arg {
                InvokeArg::Str(text) => {
                    let string = self.transport.create_string(&text)?;
                    Ok(JdwpValue::Object {
                        tag: TAG_STRING,
                        id: string.0,
                    })
                }
                InvokeArg::Value(value @ JdwpValue::Object { .. }) => Ok(value),
                InvokeArg::Value(other) => Err(BridgeError::InvalidArgument(format!(
                    "cannot pass {other:?} to {}: only strings and references are supported",
                    method.name
                ))),
            })
            .collect()
    }

    /// Waits until `thread` is parked and no other call holds it, then claims
    /// it. Returns the park sequence number at the time of the claim.
    fn claim(&self, thread: ThreadRef, what: &str) -> Result<u64> {
        let mut inner = self.wait_until(what, self.rendezvous.timeout(), |inner| {
            !inner.busy.contains(&thread)
                && inner.parks.get(&thread).is_some_and(|park| park.parked)
        })?;
        inner.busy.insert(thread);
        let park = inner.parks.entry(thread).or_default();
        park.parked = false;
        Ok(park.seq)
    }

    fn release(&self, thread: ThreadRef) {
        let mut inner = self.inner.lock();
        inner.busy.remove(&thread);
        self.cond.notify_all();
    }

    /// A rejected invocation leaves the thread where it was, unless the
    /// rejection was that it was not suspended at all.
    fn invoke_failed(&self, thread: ThreadRef, err: TransportError) -> BridgeError {
        if !matches!(
            err,
            TransportError::Disconnected | TransportError::ThreadNotSuspended(_)
        ) {
            self.inner.lock().parks.entry(thread).or_default().parked = true;
        }
        tracing::warn!(target: "vmbridge.gateway", thread = thread.0, error = %err, "invocation failed");
        err.into()
    }

    /// Blocks until `thread` has parked again since sequence `seq`.
    fn wait_reparked(&self, thread: ThreadRef, seq: u64, what: &str) -> Result<()> {
        self.wait_until(what, self.rendezvous.timeout(), |inner| {
            inner.parks.get(&thread).is_some_and(|park| park.seq > seq)
        })
        .map(drop)
    }

    /// Invokes a server operation on the worker thread.
    pub(crate) fn invoke_on_worker(
        &self,
        op: ServerOp,
        args: Vec<InvokeArg>,
        propagate_exception: bool,
    ) -> Result<Invocation> {
        let handles = self.handles()?;
        let method = self.resolve_op(op)?;
        let values = self.marshal(&method, args)?;
        let worker = handles.worker;

        let seq = self.claim(worker, "worker thread")?;
        tracing::debug!(target: "vmbridge.gateway", op = op.method_name(), "invoking on worker");
        let result = self
            .transport
            .invoke_static(
                &handles.class,
                worker,
                &method,
                &values,
                InvokePolicy::SingleThreaded,
            )
            .map_err(|err| self.invoke_failed(worker, err))
            .and_then(|outcome| {
                // The worker is still stopped at the rendezvous; let it loop
                // back around to it.
                self.transport.resume_thread(worker)?;
                self.wait_reparked(worker, seq, "worker thread")?;
                Ok(outcome)
            });
        self.release(worker);

        Ok(match result? {
            InvokeOutcome::Returned(value) => Invocation::Returned(value),
            InvokeOutcome::Threw(exception) if propagate_exception => Invocation::Threw(exception),
            InvokeOutcome::Threw(exception) => {
                tracing::debug!(
                    target: "vmbridge.gateway",
                    op = op.method_name(),
                    exception = exception.0,
                    "server operation threw"
                );
                Invocation::Reported
            }
        })
    }

    /// Loads `class_name` through the current user loader and runs its shell
    /// entry point on the main thread with every other thread free to run.
    pub(crate) fn run_shell_class(&self, class_name: &str) -> Result<RunOutcome> {
        let handles = self.handles()?;
        let class = self.load_class(class_name)?;
        let method = find_unique_method(&*self.transport, &class, SHELL_ENTRY)?;
        if method.arity() != Some(0) {
            return Err(BridgeError::ProtocolIllegal(format!(
                "{class_name}.{SHELL_ENTRY} must take no arguments, has signature {}",
                method.signature
            )));
        }
        let main = handles.main;

        let seq = self.claim(main, "main thread")?;
        self.inner.lock().run.begin();
        self.set_state(DebuggeeState::Running);
        tracing::info!(target: "vmbridge.gateway", class = class_name, "running shell class");

        let result = self.run_on_main(&class, main, &method, seq);

        let outcome = {
            let mut inner = self.inner.lock();
            inner.awaiting_main_park = false;
            match &result {
                Ok(()) => {}
                Err(BridgeError::Disconnected) => inner.run.terminated(),
                Err(err) => {
                    tracing::error!(target: "vmbridge.gateway", error = %err, "shell run failed");
                    let descriptor = internal_error(err);
                    inner.last_exception = Some(descriptor.clone());
                    inner.run.exception_thrown(descriptor);
                }
            }
            let outcome = inner.run.finish();
            inner.last_status = Some(outcome.status);
            outcome
        };
        self.release(main);
        if self.state() == DebuggeeState::Running {
            self.set_state(DebuggeeState::Idle);
        }

        tracing::info!(target: "vmbridge.gateway", status = ?outcome.status, "shell class finished");
        Ok(outcome)
    }

    fn run_on_main(
        &self,
        class: &ClassRef,
        main: ThreadRef,
        method: &MethodRef,
        seq: u64,
    ) -> Result<()> {
        let outcome = self
            .transport
            .invoke_static(class, main, method, &[], InvokePolicy::ResumeAll)
            .map_err(|err| self.invoke_failed(main, err))?;
        if let InvokeOutcome::Threw(exception) = outcome {
            self.classify_thrown(exception)?;
        }

        self.inner.lock().awaiting_main_park = true;
        self.transport.resume_all()?;
        self.wait_reparked(main, seq, "main thread")
    }

    /// Records an exception that escaped a shell run, unless the exception
    /// event already did.
    fn classify_thrown(&self, exception: ObjectRef) -> Result<()> {
        let class = self.transport.class_of(exception)?;
        if class.name == self.server.exit_exception_class {
            self.inner.lock().run.forced_exit();
            return Ok(());
        }
        if self.inner.lock().run.status().is_some() {
            return Ok(());
        }
        let descriptor = exception::describe(&*self.transport, exception, &class, None);
        let mut inner = self.inner.lock();
        inner.last_exception = Some(descriptor.clone());
        inner.run.exception_thrown(descriptor);
        Ok(())
    }

    /// Finds `name` among loaded classes, loading it through the worker when
    /// the current loader has not loaded it yet.
    pub(crate) fn load_class(&self, name: &str) -> Result<ClassRef> {
        if let Some(class) = self.find_class(name)? {
            return Ok(class);
        }
        match self.invoke_on_worker(ServerOp::LoadClass, vec![name.into()], true)? {
            Invocation::Returned(_) => {}
            Invocation::Threw(_) | Invocation::Reported => {
                return Err(BridgeError::ClassNotFound(name.to_string()))
            }
        }
        self.find_class(name)?
            .ok_or_else(|| BridgeError::ClassNotFound(name.to_string()))
    }

    pub(crate) fn find_class(&self, name: &str) -> Result<Option<ClassRef>> {
        if let Some(class) = self.inner.lock().loaders.get(name) {
            return Ok(Some(class.clone()));
        }
        let candidates = match self.transport.classes_by_name(name) {
            Ok(candidates) => candidates,
            Err(TransportError::Disconnected) => return Err(BridgeError::Disconnected),
            Err(err) => {
                tracing::debug!(target: "vmbridge.gateway", class = name, error = %err, "class lookup failed");
                Vec::new()
            }
        };
        let mut inner = self.inner.lock();
        let chosen = inner.loaders.choose(candidates);
        if let Some(class) = &chosen {
            inner.loaders.remember(class.clone());
        }
        Ok(chosen)
    }
}

/// Stands in for an exception when the run failed on our side.
fn internal_error(err: &BridgeError) -> ExceptionDescriptor {
    ExceptionDescriptor {
        class_name: "internal error".to_string(),
        message: Some(err.to_string()),
        stack: Vec::new(),
    }
}
