// Event handling
//
// Events are delivered by the target in sets; every event in a set shares
// one suspend policy and is processed in delivery order.

use crate::types::{Location, SuspendPolicy, ThreadId};
use serde::{Deserialize, Serialize};

/// Composite event batch (can contain multiple events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

impl EventSet {
    /// The thread this set's pause is anchored to: the first event's thread
    pub fn anchor_thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(Event::thread)
    }
}

/// Single event within an event set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Id of the event request that produced this event, if any
    pub request_id: Option<i32>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VmStart {
        thread: Option<ThreadId>,
    },
    VmDeath,
    Disconnected,
    ClassPrepare {
        thread: ThreadId,
        type_name: String,
    },
    ClassUnload {
        type_name: String,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Watchpoint {
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
    },
    Unknown {
        kind: u8,
    },
}

impl Event {
    pub fn new(request_id: Option<i32>, kind: EventKind) -> Self {
        Self { request_id, kind }
    }

    /// The thread the event occurred on, if it has one
    pub fn thread(&self) -> Option<ThreadId> {
        match &self.kind {
            EventKind::VmStart { thread } => *thread,
            EventKind::VmDeath | EventKind::Disconnected => None,
            EventKind::ClassPrepare { thread, .. } => Some(*thread),
            EventKind::ClassUnload { .. } => None,
            EventKind::Step { thread, .. }
            | EventKind::Breakpoint { thread, .. }
            | EventKind::Watchpoint { thread, .. }
            | EventKind::MethodEntry { thread, .. }
            | EventKind::MethodExit { thread, .. } => Some(*thread),
            EventKind::Unknown { .. } => None,
        }
    }

    /// Locatable events carry a code location and are owned by a requestor
    pub fn is_locatable(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Breakpoint { .. }
                | EventKind::Watchpoint { .. }
                | EventKind::MethodEntry { .. }
                | EventKind::MethodExit { .. }
        )
    }
}
