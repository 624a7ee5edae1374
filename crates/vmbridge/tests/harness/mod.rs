#![allow(dead_code)]


use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use vmbridge::{transport::ThreadRef, DebuggeeState, DebuggerOwner, VmController};
use vmbridge_config::{RendezvousConfig, ServerConfig};

use self::mock::{MockDebuggee, MAIN, WORKER};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Note {
    State(DebuggeeState, DebuggeeState),
    ThreadStarted(ThreadRef),
    ThreadDied(ThreadRef),
    BreakpointHit(ThreadRef),
}

/// Records every owner callback in order.
#[derive(Default)]
pub struct RecordingOwner {
    notes: Mutex<Vec<Note>>,
    cond: Condvar,
}

impl RecordingOwner {
    fn push(&self, note: Note) {
        self.notes.lock().push(note);
        self.cond.notify_all();
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().clone()
    }

    pub fn states(&self) -> Vec<(DebuggeeState, DebuggeeState)> {
        self.notes()
            .into_iter()
            .filter_map(|note| match note {
                Note::State(old, new) => Some((old, new)),
                _ => None,
            })
            .collect()
    }

    pub fn hits(&self) -> Vec<ThreadRef> {
        self.notes()
            .into_iter()
            .filter_map(|note| match note {
                Note::BreakpointHit(thread) => Some(thread),
                _ => None,
            })
            .collect()
    }

    /// Waits until `count` notes satisfy `pred`.
    pub fn wait_for(&self, count: usize, pred: impl Fn(&Note) -> bool) {
        let deadline = Instant::now() + WAIT;
        let mut notes = self.notes.lock();
        while notes.iter().filter(|note| pred(note)).count() < count {
            if self.cond.wait_until(&mut notes, deadline).timed_out() {
                panic!("timed out waiting for owner notes; saw {:?}", *notes);
            }
        }
    }

    pub fn wait_for_hits(&self, count: usize) {
        self.wait_for(count, |note| matches!(note, Note::BreakpointHit(_)));
    }
}

impl DebuggerOwner for RecordingOwner {
    fn state_changed(&self, old: DebuggeeState, new: DebuggeeState) {
        self.push(Note::State(old, new));
    }

    fn thread_started(&self, thread: ThreadRef) {
        self.push(Note::ThreadStarted(thread));
    }

    fn thread_died(&self, thread: ThreadRef) {
        self.push(Note::ThreadDied(thread));
    }

    fn breakpoint_hit(&self, thread: ThreadRef) {
        self.push(Note::BreakpointHit(thread));
    }
}

pub fn rendezvous() -> RendezvousConfig {
    RendezvousConfig {
        wait_slice_ms: 5,
        timeout_ms: Some(10_000),
        startup_timeout_ms: Some(10_000),
    }
}

pub struct Session {
    pub mock: Arc<MockDebuggee>,
    pub owner: Arc<RecordingOwner>,
    pub controller: Arc<VmController>,
}

/// Attaches a controller to `mock` without waiting for the server.
pub fn attach(mock: MockDebuggee, server: &ServerConfig) -> vmbridge::Result<Session> {
    let mock = Arc::new(mock);
    let owner = Arc::new(RecordingOwner::default());
    let controller =
        VmController::with_transport(mock.clone(), server, &rendezvous(), owner.clone())?;
    Ok(Session {
        mock,
        owner,
        controller: Arc::new(controller),
    })
}

/// A controller whose execution server has reported in.
pub fn start(mock: MockDebuggee) -> Session {
    let session = attach(mock, &ServerConfig::default()).unwrap();
    session.controller.wait_for_startup().unwrap();
    let mock = session.mock.clone();
    eventually("server threads to park", || {
        mock.suspend_count(MAIN) == 1 && mock.suspend_count(WORKER) == 1
    });
    session
}

/// Like [`start`], with a user class loader already in place.
pub fn start_with_loader(mock: MockDebuggee) -> Session {
    let session = start(mock);
    session.controller.new_class_loader(&[]).unwrap();
    session
}

/// Polls `cond` until it holds.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn wait_for_state(controller: &VmController, state: DebuggeeState) {
    eventually(&format!("state {state}"), || controller.state() == state);
}
