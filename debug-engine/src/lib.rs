// Debug-session concurrency engine
//
// Coordination core of a source-level debugger attached to a separately
// running target process:
// - serialized command dispatch on a single manager thread
// - suspend/resume voting over paused target threads
// - step-filtering decisions for automatic stepping
// - event pump and blocking evaluation that keep the session live
//
// The wire protocol, position resolution, and breakpoint persistence live
// behind the TargetHandle and RequestSubsystem traits.

pub mod command;
pub mod error;
pub mod events;
pub mod manager;
pub mod requests;
pub mod session;
pub mod step;
pub mod suspend;
pub mod target;
pub mod types;

mod evaluation;
mod pump;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{DebuggerCommand, Priority};
pub use error::{EvaluateError, TargetError, TargetResult};
pub use events::{Event, EventKind, EventSet};
pub use manager::ManagerThread;
pub use requests::{MethodExitWatcher, RequestSubsystem, Requestor};
pub use session::{DebugSession, SessionConfig, SessionListener, SessionState};
pub use step::{MethodFilter, StepDecision, StepFilters, StepHint};
pub use suspend::{Resolved, SuspendContext, SuspendManager};
pub use target::TargetHandle;
pub use types::{Location, MethodCall, MethodInfo, SourcePosition, StepDepth, SuspendPolicy, ThreadId, Value};
