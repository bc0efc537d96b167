// Request subsystem boundary
//
// Position/name resolution, breakpoint persistence, and event-request
// bookkeeping live outside this core. The engine talks to them through
// these traits.

use crate::error::TargetResult;
use crate::events::Event;
use crate::step::StepHint;
use crate::suspend::SuspendContext;
use crate::types::{RequestId, SourcePosition, StepDepth, SuspendPolicy, ThreadId};

/// The owner of an event request (typically a breakpoint), asked whether a
/// locatable event should pause.
pub trait Requestor: Send + Sync {
    /// Classify a locatable event delivered for this requestor. Returning
    /// `true` votes to resume, `false` votes to pause.
    fn should_resume(&self, ctx: &SuspendContext, event: &Event) -> bool;

    /// Called when the requestor's breakpoint was hit, regardless of whether
    /// the event resumes or pauses.
    fn notify_hit(&self, event: &Event);
}

/// Consumes method-exit events for return-value tracking. When every event
/// in a set is consumed, the set is resumed without creating a context.
pub trait MethodExitWatcher: Send + Sync {
    fn consume(&self, event: &Event) -> bool;
}

/// Event-request subsystem owned by the layers above the engine.
pub trait RequestSubsystem: Send + Sync {
    /// The requestor registered for this event, if any.
    fn find_requestor_for(&self, event: &Event) -> Option<std::sync::Arc<dyn Requestor>>;

    /// A class-prepare event arrived; notify request subscribers so deferred
    /// breakpoints can materialize.
    fn class_prepared(&self, event: &Event);

    /// Register a step request on the target, keeping the hint retrievable
    /// by request id while the request is outstanding.
    fn create_step_request(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        policy: SuspendPolicy,
        hint: StepHint,
    ) -> TargetResult<RequestId>;

    /// Delete all outstanding step requests for a thread.
    fn delete_step_requests(&self, thread: ThreadId) -> TargetResult<()>;

    /// The hint stored with an outstanding step request.
    fn step_hint_for(&self, request: RequestId) -> Option<StepHint>;

    /// Restrict breakpoint requests to one thread. Applied before any resume
    /// call when a context pauses under suspend-all; a resume implicitly
    /// clears such filters.
    fn apply_thread_filter(&self, thread: ThreadId);

    /// Install a temporary breakpoint for run-to-location.
    fn set_run_to_location(&self, position: &SourcePosition) -> TargetResult<RequestId>;

    /// Remove a temporary run-to-location breakpoint.
    fn clear_run_to_location(&self, request: RequestId);

    fn enable_breakpoints(&self);

    fn disable_breakpoints(&self);
}
