//! Bookkeeping for every breakpoint request the controller owns.
//!
//! The execution server's three marker methods and the user's line
//! breakpoints share one table keyed by request id, so the dispatcher can
//! tell what a breakpoint event means with a single lookup.

use std::collections::BTreeMap;

use crate::transport::{CodeLocation, RequestId, SuspendPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointPurpose {
    /// The server's startup notification. Suspends everything.
    Started,
    /// The rendezvous where the main and worker threads park between calls.
    Suspend,
    /// Reached when user code asks the process to exit. Suspends nothing.
    ExitMarker,
    User { class: String, line: u32 },
}

impl BreakpointPurpose {
    pub fn suspend_policy(&self) -> SuspendPolicy {
        match self {
            BreakpointPurpose::Started => SuspendPolicy::All,
            BreakpointPurpose::Suspend | BreakpointPurpose::User { .. } => {
                SuspendPolicy::EventThread
            }
            BreakpointPurpose::ExitMarker => SuspendPolicy::None,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, BreakpointPurpose::User { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRecord {
    pub request: RequestId,
    pub location: CodeLocation,
    pub purpose: BreakpointPurpose,
}

#[derive(Debug, Default)]
pub(crate) struct BreakpointTable {
    records: BTreeMap<RequestId, BreakpointRecord>,
}

impl BreakpointTable {
    pub fn insert(&mut self, record: BreakpointRecord) {
        self.records.insert(record.request, record);
    }

    pub fn purpose_of(&self, request: RequestId) -> Option<&BreakpointPurpose> {
        self.records.get(&request).map(|record| &record.purpose)
    }

    /// Removes and returns every user record for `class:line`.
    pub fn take_user(&mut self, class: &str, line: u32) -> Vec<BreakpointRecord> {
        let matching: Vec<RequestId> = self
            .records
            .values()
            .filter(|record| {
                matches!(&record.purpose,
                    BreakpointPurpose::User { class: c, line: l } if c == class && *l == line)
            })
            .map(|record| record.request)
            .collect();
        matching
            .into_iter()
            .filter_map(|request| self.records.remove(&request))
            .collect()
    }

    /// Distinct `(class, line)` pairs of user breakpoints, in request order.
    pub fn user_breakpoints(&self) -> Vec<(String, u32)> {
        let mut out: Vec<(String, u32)> = Vec::new();
        for record in self.records.values() {
            if let BreakpointPurpose::User { class, line } = &record.purpose {
                let key = (class.clone(), *line);
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        }
        out
    }

    pub fn records(&self) -> impl Iterator<Item = &BreakpointRecord> {
        self.records.values()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
