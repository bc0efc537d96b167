// Evaluation invoker
//
// Runs a blocking method call into the target from inside a command. The
// call itself runs on a temporary worker thread while the manager thread
// keeps draining its queue, so protocol events keep flowing during the
// call. Any thread state disturbed to let the call proceed is snapshotted
// and restored in every outcome.

use crate::error::{EvaluateError, TargetError};
use crate::session::DebugSession;
use crate::suspend::SuspendContext;
use crate::types::{MethodCall, SuspendPolicy, ThreadId, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bound on load-missing-class-and-retry cycles
const CLASS_LOAD_ATTEMPTS: usize = 3;

pub(crate) fn invoke_method(
    session: &Arc<DebugSession>,
    ctx: &Arc<SuspendContext>,
    call: &MethodCall,
    args: &[Value],
) -> Result<Value, EvaluateError> {
    session.manager().assert_is_manager_thread();
    let suspend_manager = session.suspend_manager();

    let Some(thread) = ctx.anchor_thread() else {
        return Err(EvaluateError::ContextInvalid);
    };
    if ctx.is_resumed() || !ctx.is_in_progress() {
        return Err(EvaluateError::ContextInvalid);
    }
    if suspend_manager.is_evaluating_on(thread) {
        return Err(EvaluateError::NestedEvaluation);
    }

    session.notify_evaluation_started(ctx);
    debug!("evaluating {}.{} on thread {}", call.declaring_type, call.name, thread);

    // resume the thread out of every *other* context that suspends it, so
    // the call cannot deadlock on contention with a foreign pause
    let mut touched: Vec<Arc<SuspendContext>> = Vec::new();
    for other in suspend_manager.suspending_contexts(thread) {
        if Arc::ptr_eq(&other, ctx) || other.anchor_thread() == Some(thread) {
            continue;
        }
        debug!("releasing thread {} from context #{}", thread, other.id());
        if let Err(e) = suspend_manager.resume_thread(&other, thread) {
            warn!("failed to release thread {} from context #{}: {}", thread, other.id(), e);
        }
        touched.push(other);
    }

    let resume_data = suspend_manager.prepare_for_resume(ctx);
    ctx.set_evaluating(Some(thread));
    session.target().invalidate_caches();

    let result = run_invoke_loop(session, ctx, thread, call, args);

    // restore in every outcome. A step request created by target code during
    // the call would otherwise fire on the next evaluation and strand the
    // user in an unrelated method.
    if let Err(e) = session.requests().delete_step_requests(thread) {
        if e.is_disconnect() {
            debug!("step request cleanup hit disconnect");
        } else {
            warn!("failed to delete dangling step requests: {}", e);
        }
    }
    ctx.set_evaluating(None);
    suspend_manager.restore_after_resume(ctx, resume_data);
    for other in suspend_manager.event_contexts() {
        let was_touched = touched.iter().any(|t| Arc::ptr_eq(t, &other));
        if was_touched && !other.is_evaluating() && !other.suspends(thread) {
            if let Err(e) = suspend_manager.suspend_thread(&other, thread) {
                warn!("failed to re-suspend thread {} into context #{}: {}", thread, other.id(), e);
            }
        }
    }
    session.target().invalidate_caches();
    session.notify_evaluation_finished(ctx);

    result
}

fn run_invoke_loop(
    session: &Arc<DebugSession>,
    ctx: &Arc<SuspendContext>,
    thread: ThreadId,
    call: &MethodCall,
    args: &[Value],
) -> Result<Value, EvaluateError> {
    // under an event-thread pause only the invoking thread may run
    let single_threaded = ctx.suspend_policy() == SuspendPolicy::EventThread;
    let mut attempts = 0;
    loop {
        let target = Arc::clone(session.target());
        let worker_call = call.clone();
        let worker_args = args.to_vec();
        let forked = session.manager().fork_and_wait(move || {
            target.invoke_method(thread, &worker_call, &worker_args, single_threaded)
        });
        let outcome = match forked {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(EvaluateError::wrap(TargetError::InvocationFailed(
                    "evaluation worker failed".into(),
                )))
            }
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(TargetError::ClassNotLoaded(type_name)) => {
                attempts += 1;
                if attempts >= CLASS_LOAD_ATTEMPTS {
                    return Err(EvaluateError::wrap(TargetError::ClassNotLoaded(type_name)));
                }
                debug!("loading missing class {} and retrying", type_name);
                if let Err(e) = session.target().load_class(thread, &type_name) {
                    return Err(EvaluateError::wrap(e));
                }
            }
            Err(e) => return Err(EvaluateError::wrap(e)),
        }
    }
}
