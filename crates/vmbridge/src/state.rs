use std::fmt;

use serde::Serialize;

/// Externally visible state of the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebuggeeState {
    /// Launched but the execution server has not reported in yet.
    NotReady,
    /// The main thread is parked at its rendezvous.
    Idle,
    /// The main thread is executing user code.
    Running,
    /// Stopped at a user breakpoint or step.
    Suspended,
    /// The channel is gone. Terminal.
    Terminated,
}

impl fmt::Display for DebuggeeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DebuggeeState::NotReady => "not ready",
            DebuggeeState::Idle => "idle",
            DebuggeeState::Running => "running",
            DebuggeeState::Suspended => "suspended",
            DebuggeeState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub old: DebuggeeState,
    pub new: DebuggeeState,
}

#[derive(Debug)]
pub(crate) struct StateMachine {
    current: DebuggeeState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: DebuggeeState::NotReady,
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> DebuggeeState {
        self.current
    }

    /// Moves to `to`, returning the transition to report.
    ///
    /// Nothing leaves `Terminated`, nothing returns to `NotReady`, and
    /// `NotReady` only ever becomes `Idle` or `Terminated`. Self-transitions
    /// are not reported.
    pub fn transition(&mut self, to: DebuggeeState) -> Option<Transition> {
        use DebuggeeState::*;

        let from = self.current;
        let allowed = match (from, to) {
            _ if from == to => false,
            (Terminated, _) | (_, NotReady) => false,
            (NotReady, Idle | Terminated) => true,
            (NotReady, _) => false,
            _ => true,
        };
        if !allowed {
            if from != to {
                tracing::debug!(
                    target: "vmbridge.controller",
                    %from,
                    %to,
                    "ignoring state transition"
                );
            }
            return None;
        }
        self.current = to;
        Some(Transition { old: from, new: to })
    }
}
