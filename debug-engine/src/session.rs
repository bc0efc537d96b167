// Debug session
//
// One session per attached target process. Owns the manager thread and the
// suspend manager, tracks the lifecycle state machine, and exposes the
// command surface the UI layer drives. Every lifecycle transition and every
// suspend-manager mutation runs on the manager thread.

use crate::command::{DebuggerCommand, Priority};
use crate::error::{EvaluateError, TargetResult};
use crate::manager::ManagerThread;
use crate::pump::EventPump;
use crate::requests::{MethodExitWatcher, RequestSubsystem};
use crate::step::{MethodFilter, StepFilters, StepHint};
use crate::suspend::{Resolved, SuspendContext, SuspendManager};
use crate::target::TargetHandle;
use crate::types::{FrameId, MethodCall, RequestId, SourcePosition, StepDepth, SuspendPolicy, ThreadId, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a session; monotonic, no transition skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Attached,
    Detaching,
    Detached,
}

/// Tunables the embedder passes in at session creation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default suspend policy for step requests
    pub suspend_policy: SuspendPolicy,
    pub step_filters: StepFilters,
    /// Attempts for a resume that hits benign target contention
    pub resume_attempts: usize,
    /// How long `stop` waits before restarting a stuck manager worker
    pub terminate_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            suspend_policy: SuspendPolicy::All,
            step_filters: StepFilters::default(),
            resume_attempts: 5,
            terminate_timeout: Duration::from_secs(3),
        }
    }
}

/// Observer interface for the UI/session layer. Notifications fire
/// synchronously on the manager thread to preserve ordering.
pub trait SessionListener: Send + Sync {
    fn on_attached(&self) {}
    fn on_detached(&self, _closed_by_user: bool) {}
    fn on_paused(&self, _ctx: &Arc<SuspendContext>) {}
    fn on_resumed(&self, _ctx: &Arc<SuspendContext>) {}
    fn on_evaluation_started(&self, _ctx: &Arc<SuspendContext>) {}
    fn on_evaluation_finished(&self, _ctx: &Arc<SuspendContext>) {}
}

pub struct DebugSession {
    target: Arc<dyn TargetHandle>,
    requests: Arc<dyn RequestSubsystem>,
    config: SessionConfig,
    manager: ManagerThread,
    suspend_manager: SuspendManager,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    method_exit_watcher: Mutex<Option<Arc<dyn MethodExitWatcher>>>,
    run_to_location: Mutex<Option<RequestId>>,
    /// Guards the exactly-once stop path
    stop_requested: AtomicBool,
    /// Self-handle so commands built here can capture the session
    me: Weak<DebugSession>,
}

impl DebugSession {
    pub fn new(
        target: Arc<dyn TargetHandle>,
        requests: Arc<dyn RequestSubsystem>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let suspend_manager = SuspendManager::new(Arc::clone(&target), config.resume_attempts);
        Arc::new_cyclic(|me| Self {
            target,
            requests,
            config,
            manager: ManagerThread::new(),
            suspend_manager,
            state: Mutex::new(SessionState::Initial),
            listeners: Mutex::new(Vec::new()),
            method_exit_watcher: Mutex::new(None),
            run_to_location: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.state() == SessionState::Attached
    }

    pub fn is_detached(&self) -> bool {
        self.state() == SessionState::Detached
    }

    pub fn target(&self) -> &Arc<dyn TargetHandle> {
        &self.target
    }

    pub fn requests(&self) -> &Arc<dyn RequestSubsystem> {
        &self.requests
    }

    pub fn manager(&self) -> &ManagerThread {
        &self.manager
    }

    pub fn suspend_manager(&self) -> &SuspendManager {
        &self.suspend_manager
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_method_exit_watcher(&self, watcher: Option<Arc<dyn MethodExitWatcher>>) {
        *self.method_exit_watcher.lock() = watcher;
    }

    pub(crate) fn method_exit_watcher(&self) -> Option<Arc<dyn MethodExitWatcher>> {
        self.method_exit_watcher.lock().clone()
    }

    /// Commit the connected target: move to `Attached` and start draining
    /// its event stream.
    pub fn attach(&self) {
        let Some(session) = self.me.upgrade() else { return };
        self.manager.invoke(DebuggerCommand::new(Priority::High, move || {
            {
                let mut state = session.state.lock();
                if *state != SessionState::Initial {
                    error!("attach in state {:?}", *state);
                    return Ok(());
                }
                *state = SessionState::Attached;
            }
            info!("target attached");
            EventPump::spawn(&session);
            session.notify_attached();
            Ok(())
        }));
    }

    /// Stop the session: terminate the target when `force` is set, otherwise
    /// detach and leave it running. Exactly-once; later calls are ignored.
    pub fn stop(&self, force: bool) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.me.upgrade() else { return };
        let cmd = DebuggerCommand::new(Priority::High, move || {
            if session.is_attached() {
                let result = if force {
                    session.target.exit(-1)
                } else {
                    // some targets do not resume threads on their own when
                    // the debugger detaches
                    let _ = session.target.resume_all();
                    session.target.dispose()
                };
                if let Err(e) = result {
                    if e.is_disconnect() {
                        debug!("target already gone during stop: {}", e);
                    } else {
                        warn!("stop failed: {}", e);
                    }
                }
            }
            session.close_process(true);
            Ok(())
        });
        self.manager.terminate_and_invoke(cmd, self.config.terminate_timeout);
    }

    /// Tear the session down: `Attached -> Detaching -> Detached`, closing
    /// the command queue in between. Safe to call twice; the second call is
    /// a no-op.
    pub(crate) fn close_process(&self, closed_by_user: bool) {
        self.manager.assert_is_manager_thread();
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Detaching | SessionState::Detached) {
                return;
            }
            *state = SessionState::Detaching;
        }
        info!("closing debug session (closed_by_user={})", closed_by_user);
        self.manager.close();
        *self.state.lock() = SessionState::Detached;
        self.notify_detached(closed_by_user);
    }

    /// Suspend the whole target and publish a synthetic zero-vote pause.
    pub fn pause(&self) {
        let Some(session) = self.me.upgrade() else { return };
        self.manager.invoke(DebuggerCommand::new(Priority::High, move || {
            if !session.is_attached() || session.suspend_manager.has_paused_context() {
                debug!("ignoring pause request");
                return Ok(());
            }
            session.target.suspend_all()?;
            if let Ok(threads) = session.target.all_threads() {
                debug!("suspended {} target threads", threads.len());
            }
            let ctx = session
                .suspend_manager
                .push_suspend_context(SuspendPolicy::All, 0, None);
            session.suspend_manager.push_paused(&ctx);
            session.notify_paused(&ctx);
            Ok(())
        }));
    }

    /// Resume a paused context.
    pub fn resume(&self, ctx: &Arc<SuspendContext>) {
        let Some(session) = self.me.upgrade() else { return };
        let resume_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                info!("process resumed");
                session.resume_context(&resume_ctx)
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    pub fn step_into(
        &self,
        ctx: &Arc<SuspendContext>,
        ignore_filters: bool,
        smart_filter: Option<MethodFilter>,
    ) {
        let Some(session) = self.me.upgrade() else { return };
        let step_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                let Some(thread) = step_ctx.anchor_thread() else {
                    warn!("step into without an anchor thread");
                    return Ok(());
                };
                info!("step into");
                let mut hint = StepHint::capture(StepDepth::Into, session.target.as_ref(), thread);
                hint.set_ignore_filters(ignore_filters);
                if smart_filter.is_some() {
                    hint.set_skip_this_method(true);
                    hint.set_smart_filter(smart_filter);
                }
                session.do_step(thread, StepDepth::Into, hint)?;
                session.resume_context(&step_ctx)
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    pub fn step_over(&self, ctx: &Arc<SuspendContext>, ignore_breakpoints: bool) {
        let Some(session) = self.me.upgrade() else { return };
        let step_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                let Some(thread) = step_ctx.anchor_thread() else {
                    warn!("step over without an anchor thread");
                    return Ok(());
                };
                info!("step over");
                let mut hint = StepHint::capture(StepDepth::Over, session.target.as_ref(), thread);
                hint.set_restore_breakpoints(ignore_breakpoints);
                session.do_step(thread, StepDepth::Over, hint)?;
                if ignore_breakpoints {
                    session.requests.disable_breakpoints();
                }
                session.resume_context(&step_ctx)
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    pub fn step_out(&self, ctx: &Arc<SuspendContext>) {
        let Some(session) = self.me.upgrade() else { return };
        let step_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                let Some(thread) = step_ctx.anchor_thread() else {
                    warn!("step out without an anchor thread");
                    return Ok(());
                };
                info!("step out");
                let hint = StepHint::capture(StepDepth::Out, session.target.as_ref(), thread);
                session.do_step(thread, StepDepth::Out, hint)?;
                session.resume_context(&step_ctx)
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    /// Install a temporary breakpoint at `position` and resume. The request
    /// is cancelled when the next pause publishes, or when superseded.
    pub fn run_to_location(&self, ctx: &Arc<SuspendContext>, position: SourcePosition) {
        let Some(session) = self.me.upgrade() else { return };
        let run_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                info!("run to {}:{}", position.file, position.line);
                if let Some(token) = session.run_to_location.lock().take() {
                    session.requests.clear_run_to_location(token);
                }
                let token = session.requests.set_run_to_location(&position)?;
                *session.run_to_location.lock() = Some(token);
                session.resume_context(&run_ctx)
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    pub fn freeze_thread(&self, thread: ThreadId) {
        let Some(session) = self.me.upgrade() else { return };
        self.manager.invoke(DebuggerCommand::new(Priority::Normal, move || {
            if session.suspend_manager.is_frozen(thread) {
                return Ok(());
            }
            session.suspend_manager.freeze_thread(thread)
        }));
    }

    pub fn unfreeze_thread(&self, thread: ThreadId) {
        let Some(session) = self.me.upgrade() else { return };
        self.manager.invoke(DebuggerCommand::new(Priority::Normal, move || {
            if !session.suspend_manager.is_frozen(thread) {
                return Ok(());
            }
            session.suspend_manager.unfreeze_thread(thread)
        }));
    }

    /// Resume a single thread out of everything that suspends it. A frozen
    /// thread is unfrozen; a context anchored to the thread is resumed whole,
    /// re-entrantly through `invoke`.
    pub fn resume_thread(&self, ctx: &Arc<SuspendContext>, thread: ThreadId) {
        let Some(session) = self.me.upgrade() else { return };
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                if session.suspend_manager.is_frozen(thread) {
                    return session.suspend_manager.unfreeze_thread(thread);
                }
                for suspending in session.suspend_manager.suspending_contexts(thread) {
                    if suspending.anchor_thread() == Some(thread) {
                        let inner_session = Arc::clone(&session);
                        let inner_ctx = Arc::clone(&suspending);
                        session.manager.invoke(
                            DebuggerCommand::new(Priority::Normal, move || {
                                inner_session.resume_context(&inner_ctx)
                            })
                            .bound_to(suspending),
                        );
                    } else {
                        session.suspend_manager.resume_thread(&suspending, thread)?;
                    }
                }
                Ok(())
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    /// Discard frames on the context's thread, then re-enter a paused state
    /// without waiting for a new target event.
    pub fn pop_frame(&self, ctx: &Arc<SuspendContext>, frame: FrameId) {
        let Some(session) = self.me.upgrade() else { return };
        let pop_ctx = Arc::clone(ctx);
        self.manager.invoke(
            DebuggerCommand::new(Priority::Normal, move || {
                let Some(thread) = pop_ctx.anchor_thread() else {
                    warn!("frame pop without an anchor thread");
                    return Ok(());
                };
                if !session.suspend_manager.is_suspended(thread) {
                    warn!("frame pop on a running thread");
                    return Ok(());
                }
                if !pop_ctx.suspends(thread) {
                    warn!("context #{} does not suspend thread {}, dropping frame pop", pop_ctx.id(), thread);
                    return Ok(());
                }
                if let Err(e) = session.target.pop_frames(thread, frame) {
                    error!("frame pop failed: {}", e);
                }
                let new_ctx = session.suspend_manager.pop_frame(&pop_ctx);
                session.notify_paused(&new_ctx);
                Ok(())
            })
            .bound_to(Arc::clone(ctx)),
        );
    }

    /// Run a blocking method call in the target. Must be called on the
    /// manager thread, from inside the command that owns `ctx`.
    pub fn evaluate(
        &self,
        ctx: &Arc<SuspendContext>,
        call: &MethodCall,
        args: &[Value],
    ) -> Result<Value, EvaluateError> {
        let Some(session) = self.me.upgrade() else {
            return Err(EvaluateError::ContextInvalid);
        };
        crate::evaluation::invoke_method(&session, ctx, call, args)
    }

    /// Delete stale step requests and register a new one carrying the hint.
    pub(crate) fn do_step(&self, thread: ThreadId, depth: StepDepth, hint: StepHint) -> TargetResult<()> {
        debug!("creating step request for thread {}", thread);
        self.requests.delete_step_requests(thread)?;
        self.requests
            .create_step_request(thread, depth, self.config.suspend_policy, hint)?;
        Ok(())
    }

    /// Resume a context through the suspend manager and tell the listeners.
    pub(crate) fn resume_context(&self, ctx: &Arc<SuspendContext>) -> TargetResult<()> {
        self.suspend_manager.resume(ctx)?;
        self.notify_resumed(ctx);
        Ok(())
    }

    /// Record a classification vote and publish the pause if this vote
    /// resolved the context.
    pub(crate) fn cast_vote(&self, ctx: &Arc<SuspendContext>, resume: bool) {
        let result = if resume {
            self.suspend_manager.vote_resume(ctx)
        } else {
            self.suspend_manager.vote_suspend(ctx)
        };
        match result {
            Ok(Some(Resolved::Paused)) => self.notify_paused(ctx),
            Ok(_) => {}
            Err(e) if e.is_disconnect() => debug!("resume after voting hit disconnect: {}", e),
            Err(e) => error!("resume after voting failed: {}", e),
        }
    }

    pub(crate) fn notify_attached(&self) {
        for listener in self.listeners.lock().iter() {
            listener.on_attached();
        }
    }

    pub(crate) fn notify_detached(&self, closed_by_user: bool) {
        for listener in self.listeners.lock().iter() {
            listener.on_detached(closed_by_user);
        }
    }

    pub(crate) fn notify_paused(&self, ctx: &Arc<SuspendContext>) {
        // a pause supersedes any outstanding run-to-location request
        if let Some(token) = self.run_to_location.lock().take() {
            self.requests.clear_run_to_location(token);
        }
        for listener in self.listeners.lock().iter() {
            listener.on_paused(ctx);
        }
    }

    pub(crate) fn notify_resumed(&self, ctx: &Arc<SuspendContext>) {
        for listener in self.listeners.lock().iter() {
            listener.on_resumed(ctx);
        }
    }

    pub(crate) fn notify_evaluation_started(&self, ctx: &Arc<SuspendContext>) {
        for listener in self.listeners.lock().iter() {
            listener.on_evaluation_started(ctx);
        }
    }

    pub(crate) fn notify_evaluation_finished(&self, ctx: &Arc<SuspendContext>) {
        for listener in self.listeners.lock().iter() {
            listener.on_evaluation_finished(ctx);
        }
    }
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("state", &self.state())
            .finish()
    }
}
