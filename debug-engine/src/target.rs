// Target handle
//
// Abstract capability boundary to the process under debug. The engine never
// sees the wire protocol; a transport layer implements this trait and keeps
// the per-thread suspend counts that make paired suspend/resume calls safe.

use crate::error::TargetResult;
use crate::events::EventSet;
use crate::types::{FrameId, MethodCall, MethodInfo, SourcePosition, ThreadId, Value};

/// Capability to control and observe the target process.
///
/// All methods block the calling thread. `next_event_set` is only ever called
/// from the event pump; everything else is called from the manager thread or
/// the temporary evaluation worker.
pub trait TargetHandle: Send + Sync {
    /// Wait for the next event set from the target.
    fn next_event_set(&self) -> TargetResult<EventSet>;

    /// Suspend every thread of the target (increments each suspend count).
    fn suspend_all(&self) -> TargetResult<()>;

    /// Resume every thread of the target (decrements each suspend count).
    fn resume_all(&self) -> TargetResult<()>;

    fn suspend_thread(&self, thread: ThreadId) -> TargetResult<()>;

    fn resume_thread(&self, thread: ThreadId) -> TargetResult<()>;

    fn all_threads(&self) -> TargetResult<Vec<ThreadId>>;

    /// Number of stack frames on a suspended thread.
    fn frame_count(&self, thread: ThreadId) -> TargetResult<usize>;

    /// Source position of the top frame, if debug info resolves one.
    fn current_position(&self, thread: ThreadId) -> TargetResult<Option<SourcePosition>>;

    /// The method the top frame is executing.
    fn method_at(&self, thread: ThreadId) -> TargetResult<MethodInfo>;

    /// Run a method in the target on the given suspended thread. Blocks until
    /// the call returns. With `single_threaded` set, only the invoking thread
    /// is allowed to run during the call.
    fn invoke_method(
        &self,
        thread: ThreadId,
        call: &MethodCall,
        args: &[Value],
        single_threaded: bool,
    ) -> TargetResult<Value>;

    /// Force-load a class that an invocation reported missing.
    fn load_class(&self, thread: ThreadId, type_name: &str) -> TargetResult<()>;

    /// Discard frames above and including `frame` on the given thread.
    fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> TargetResult<()>;

    /// Drop any cached target state (thread status, frames). Called around
    /// evaluation, which runs target code and invalidates everything.
    fn invalidate_caches(&self);

    /// Terminate the target process.
    fn exit(&self, code: i32) -> TargetResult<()>;

    /// Detach from the target, leaving it running.
    fn dispose(&self) -> TargetResult<()>;
}
