//! The single consumer of debuggee events.
//!
//! Runs on its own thread for the lifetime of the channel, turning events
//! into rendezvous bookkeeping, run outcomes, state changes and owner
//! notifications. When the event stream ends the controller is marked
//! terminated and every waiter is released.

use std::{io, sync::Arc, thread};

use crate::{
    breakpoints::BreakpointPurpose,
    controller::Shared,
    error::{BridgeError, Result},
    exception,
    server::{find_thread, ServerHandles},
    state::DebuggeeState,
    transport::{
        ClassRef, CodeLocation, ObjectRef, RequestId, ThreadRef, TransportError, TransportEvent,
    },
};

pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("vmbridge-dispatch".to_string())
        .spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    loop {
        let event = match shared.transport.next_event() {
            Ok(Some(event)) => event,
            Ok(None) | Err(TransportError::Disconnected) => break,
            Err(err) => {
                tracing::warn!(target: "vmbridge.dispatch", error = %err, "dropping undecodable event");
                continue;
            }
        };
        tracing::trace!(target: "vmbridge.dispatch", ?event, "event");
        if let Err(err) = handle(shared, event) {
            if err.is_disconnect() {
                tracing::debug!(target: "vmbridge.dispatch", "debuggee went away while handling event");
            } else {
                tracing::warn!(target: "vmbridge.dispatch", error = %err, "failed to handle event");
            }
        }
    }
    tracing::debug!(target: "vmbridge.dispatch", "event stream ended");
    shared.mark_disconnected();
}

fn handle(shared: &Shared, event: TransportEvent) -> Result<()> {
    match event {
        TransportEvent::VmStart { .. } => Ok(()),
        TransportEvent::ClassPrepare { class, .. } => on_class_prepare(shared, &class),
        TransportEvent::Breakpoint {
            request,
            thread,
            location,
        } => {
            let purpose = shared.inner.lock().breakpoints.purpose_of(request).cloned();
            match purpose {
                Some(BreakpointPurpose::Started) => on_started(shared),
                Some(BreakpointPurpose::Suspend) => {
                    on_park(shared, thread);
                    Ok(())
                }
                Some(BreakpointPurpose::ExitMarker) => on_exit_marker(shared),
                Some(BreakpointPurpose::User { .. }) => on_user_stop(shared, thread, &location),
                None => {
                    tracing::debug!(
                        target: "vmbridge.dispatch",
                        request = request.0,
                        "breakpoint for a request no longer tracked"
                    );
                    Ok(shared.transport.resume_thread(thread)?)
                }
            }
        }
        TransportEvent::Step {
            request,
            thread,
            location,
        } => on_step(shared, request, thread, &location),
        TransportEvent::Exception {
            thread, exception, ..
        } => on_exception(shared, thread, exception),
        TransportEvent::ThreadStart { thread } => {
            shared.owner.thread_started(thread);
            Ok(())
        }
        TransportEvent::ThreadDeath { thread } => {
            shared.owner.thread_died(thread);
            Ok(())
        }
        TransportEvent::VmDeath => {
            shared.mark_disconnected();
            Ok(())
        }
    }
}

/// The server class was loaded with everything suspended.
fn on_class_prepare(shared: &Shared, class: &ClassRef) -> Result<()> {
    if class.name == shared.server.class {
        let installed = shared.install_markers_once(class);
        shared.transport.resume_all()?;
        installed
    } else {
        Ok(shared.transport.resume_all()?)
    }
}

/// The server reached its startup marker with everything suspended.
fn on_started(shared: &Shared) -> Result<()> {
    let resolved = resolve_handles(shared);
    let transition = {
        let mut inner = shared.inner.lock();
        let transition = match resolved {
            Ok(handles) => {
                inner.parks.entry(handles.main).or_default();
                inner.parks.entry(handles.worker).or_default();
                inner.handles = Some(handles);
                inner.state.transition(DebuggeeState::Idle)
            }
            Err(err) => {
                tracing::error!(target: "vmbridge.dispatch", error = %err, "execution server is unusable");
                inner.startup_error = Some(err.to_string());
                None
            }
        };
        inner.started = true;
        shared.cond.notify_all();
        transition
    };
    shared.report(transition);
    tracing::info!(target: "vmbridge.dispatch", "execution server started");
    Ok(shared.transport.resume_all()?)
}

fn resolve_handles(shared: &Shared) -> Result<ServerHandles> {
    let transport = &*shared.transport;
    let known = shared.inner.lock().server_class.clone();
    let class = match known {
        Some(class) => class,
        None => transport
            .classes_by_name(&shared.server.class)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::MissingServerMember(shared.server.class.clone()))?,
    };
    let main = find_thread(transport, &shared.server, &shared.server.main_thread)?;
    let worker = find_thread(transport, &shared.server, &shared.server.worker_thread)?;
    let exit_exception = transport
        .static_field(&class, &shared.server.exit_exception_field)?
        .and_then(|value| value.object_id())
        .map(ObjectRef)
        .ok_or_else(|| {
            BridgeError::MissingServerMember(format!(
                "{}.{}",
                shared.server.class, shared.server.exit_exception_field
            ))
        })?;
    Ok(ServerHandles {
        class,
        main,
        worker,
        exit_exception,
    })
}

fn on_park(shared: &Shared, thread: ThreadRef) {
    let transition = {
        let mut inner = shared.inner.lock();
        let park = inner.parks.entry(thread).or_default();
        park.seq += 1;
        park.parked = true;
        // Main settles a run; the worker settles whatever it ran when no run
        // is in flight, e.g. a test method that stopped at a breakpoint.
        let settled = match &inner.handles {
            Some(handles) if handles.main == thread => inner.awaiting_main_park,
            Some(handles) if handles.worker == thread => !inner.run.is_active(),
            _ => false,
        };
        let transition = if settled && inner.state.current() == DebuggeeState::Running {
            inner.state.transition(DebuggeeState::Idle)
        } else {
            None
        };
        shared.cond.notify_all();
        transition
    };
    tracing::trace!(target: "vmbridge.dispatch", thread = thread.0, "thread parked");
    shared.report(transition);
}

/// User code asked to exit. The marker suspends nothing, so the main thread
/// may still be running user code; unwind it with the server's exit exception.
fn on_exit_marker(shared: &Shared) -> Result<()> {
    let handles = {
        let mut inner = shared.inner.lock();
        if inner.run.is_active() {
            inner.run.forced_exit();
        }
        inner.handles.clone()
    };
    tracing::info!(target: "vmbridge.dispatch", "user code requested exit");
    let Some(handles) = handles else {
        return Ok(());
    };
    if !shared.transport.is_suspended(handles.main)? {
        shared
            .transport
            .stop_thread(handles.main, handles.exit_exception)?;
    }
    Ok(())
}

fn on_user_stop(shared: &Shared, thread: ThreadRef, location: &CodeLocation) -> Result<()> {
    let class = shared.transport.class_name_at(location)?;
    if class.starts_with(&shared.server.shell_class_prefix) {
        // Generated shell code is never shown to the user.
        return Ok(shared.transport.resume_thread(thread)?);
    }
    tracing::debug!(target: "vmbridge.dispatch", thread = thread.0, class, "stopped in user code");
    shared.set_state(DebuggeeState::Suspended);
    shared.owner.breakpoint_hit(thread);
    Ok(())
}

fn on_step(
    shared: &Shared,
    request: RequestId,
    thread: ThreadRef,
    location: &CodeLocation,
) -> Result<()> {
    let ours = shared.inner.lock().steps.remove(&request);
    if !ours {
        return Ok(shared.transport.resume_thread(thread)?);
    }
    // A thread may only have one step request at a time.
    if let Err(err) = shared.transport.clear_step(request) {
        tracing::debug!(target: "vmbridge.dispatch", error = %err, "could not clear step request");
    }
    on_user_stop(shared, thread, location)
}

/// Uncaught exception events suspend only the throwing thread. Capture what
/// the exception says while its stack is intact, then let it continue.
fn on_exception(shared: &Shared, thread: ThreadRef, exception: ObjectRef) -> Result<()> {
    let recorded = record_exception(shared, thread, exception);
    shared.transport.resume_thread(thread)?;
    recorded
}

fn record_exception(shared: &Shared, thread: ThreadRef, exception: ObjectRef) -> Result<()> {
    let class = shared.transport.class_of(exception)?;
    if class.name == shared.server.exit_exception_class {
        let mut inner = shared.inner.lock();
        if inner.run.is_active() {
            inner.run.forced_exit();
        }
        return Ok(());
    }
    let descriptor = exception::describe(&*shared.transport, exception, &class, Some(thread));
    tracing::debug!(
        target: "vmbridge.dispatch",
        class = %descriptor.class_name,
        message = ?descriptor.message,
        "uncaught exception"
    );
    let mut inner = shared.inner.lock();
    // Server operations fail on the worker independently of the run on main.
    let from_worker = inner.handles.as_ref().is_some_and(|h| h.worker == thread);
    if inner.run.is_active() && !from_worker {
        inner.run.exception_thrown(descriptor.clone());
    }
    inner.last_exception = Some(descriptor);
    Ok(())
}
