use crate::{state::DebuggeeState, transport::ThreadRef};

/// Receives notifications from the controller.
///
/// Called from the dispatcher thread (and from callers' threads for the
/// `Running` bracket of a run) with no controller lock held, so
/// implementations may call back into the controller.
pub trait DebuggerOwner: Send + Sync {
    fn state_changed(&self, _old: DebuggeeState, _new: DebuggeeState) {}

    fn thread_started(&self, _thread: ThreadRef) {}

    fn thread_died(&self, _thread: ThreadRef) {}

    /// A thread stopped at a user breakpoint or completed a step.
    fn breakpoint_hit(&self, _thread: ThreadRef) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOwner;

impl DebuggerOwner for NoopOwner {}
