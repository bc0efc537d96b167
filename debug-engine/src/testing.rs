// Test support
//
// Scripted in-memory target and request subsystem so the engine can be
// exercised without a transport.

use crate::command::{DebuggerCommand, Priority};
use crate::error::{TargetError, TargetResult};
use crate::events::{Event, EventSet};
use crate::requests::{RequestSubsystem, Requestor};
use crate::session::{DebugSession, SessionConfig, SessionListener};
use crate::step::StepHint;
use crate::suspend::SuspendContext;
use crate::target::TargetHandle;
use crate::types::{
    FrameId, MethodCall, MethodInfo, RequestId, SourcePosition, StepDepth, SuspendPolicy, ThreadId,
    Value,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetCall {
    SuspendAll,
    ResumeAll,
    SuspendThread(ThreadId),
    ResumeThread(ThreadId),
    Invoke(String),
    LoadClass(String),
    PopFrames(ThreadId),
    InvalidateCaches,
    Exit(i32),
    Dispose,
}

/// Scripted target: records every control call and serves positions, methods,
/// and invocation results set up by the test.
pub(crate) struct MockTarget {
    threads: Vec<ThreadId>,
    calls: Mutex<Vec<TargetCall>>,
    counts: Mutex<HashMap<ThreadId, i64>>,
    positions: Mutex<HashMap<ThreadId, (Option<SourcePosition>, usize)>>,
    methods: Mutex<HashMap<ThreadId, MethodInfo>>,
    invoke_results: Mutex<VecDeque<TargetResult<Value>>>,
    resume_contention: AtomicUsize,
    disconnected: AtomicBool,
    event_tx: crossbeam_channel::Sender<EventSet>,
    event_rx: crossbeam_channel::Receiver<EventSet>,
}

impl MockTarget {
    pub(crate) fn new(threads: Vec<ThreadId>) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        Self {
            threads,
            calls: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            invoke_results: Mutex::new(VecDeque::new()),
            resume_contention: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
            event_tx,
            event_rx,
        }
    }

    pub(crate) fn calls(&self) -> Vec<TargetCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn suspend_count(&self, thread: ThreadId) -> i64 {
        *self.counts.lock().get(&thread).unwrap_or(&0)
    }

    pub(crate) fn set_position(
        &self,
        thread: ThreadId,
        position: Option<SourcePosition>,
        frames: usize,
    ) {
        self.positions.lock().insert(thread, (position, frames));
    }

    pub(crate) fn set_method(&self, thread: ThreadId, method: MethodInfo) {
        self.methods.lock().insert(thread, method);
    }

    pub(crate) fn push_invoke_result(&self, result: TargetResult<Value>) {
        self.invoke_results.lock().push_back(result);
    }

    /// The next `n` resume calls fail with benign contention.
    pub(crate) fn fail_resumes_with_contention(&self, n: usize) {
        self.resume_contention.store(n, Ordering::SeqCst);
    }

    pub(crate) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn send_event_set(&self, set: EventSet) {
        let _ = self.event_tx.send(set);
    }

    fn check_connected(&self) -> TargetResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(TargetError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn record(&self, call: TargetCall) {
        self.calls.lock().push(call);
    }

    fn take_contention(&self) -> Option<TargetError> {
        let remaining = self.resume_contention.load(Ordering::SeqCst);
        if remaining > 0 {
            self.resume_contention.store(remaining - 1, Ordering::SeqCst);
            Some(TargetError::InternalContention(502))
        } else {
            None
        }
    }
}

impl TargetHandle for MockTarget {
    fn next_event_set(&self) -> TargetResult<EventSet> {
        loop {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TargetError::Disconnected);
            }
            match self.event_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(set) => return Ok(set),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(TargetError::Disconnected)
                }
            }
        }
    }

    fn suspend_all(&self) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::SuspendAll);
        let mut counts = self.counts.lock();
        for thread in &self.threads {
            *counts.entry(*thread).or_insert(0) += 1;
        }
        Ok(())
    }

    fn resume_all(&self) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::ResumeAll);
        if let Some(err) = self.take_contention() {
            return Err(err);
        }
        let mut counts = self.counts.lock();
        for thread in &self.threads {
            *counts.entry(*thread).or_insert(0) -= 1;
        }
        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadId) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::SuspendThread(thread));
        *self.counts.lock().entry(thread).or_insert(0) += 1;
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadId) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::ResumeThread(thread));
        if let Some(err) = self.take_contention() {
            return Err(err);
        }
        *self.counts.lock().entry(thread).or_insert(0) -= 1;
        Ok(())
    }

    fn all_threads(&self) -> TargetResult<Vec<ThreadId>> {
        self.check_connected()?;
        Ok(self.threads.clone())
    }

    fn frame_count(&self, thread: ThreadId) -> TargetResult<usize> {
        self.check_connected()?;
        self.positions
            .lock()
            .get(&thread)
            .map(|(_, frames)| *frames)
            .ok_or(TargetError::InvalidThread(thread))
    }

    fn current_position(&self, thread: ThreadId) -> TargetResult<Option<SourcePosition>> {
        self.check_connected()?;
        self.positions
            .lock()
            .get(&thread)
            .map(|(position, _)| position.clone())
            .ok_or(TargetError::InvalidThread(thread))
    }

    fn method_at(&self, thread: ThreadId) -> TargetResult<MethodInfo> {
        self.check_connected()?;
        self.methods
            .lock()
            .get(&thread)
            .cloned()
            .ok_or(TargetError::InvalidThread(thread))
    }

    fn invoke_method(
        &self,
        _thread: ThreadId,
        call: &MethodCall,
        _args: &[Value],
        _single_threaded: bool,
    ) -> TargetResult<Value> {
        self.check_connected()?;
        self.record(TargetCall::Invoke(call.name.clone()));
        self.invoke_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Void))
    }

    fn load_class(&self, _thread: ThreadId, type_name: &str) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::LoadClass(type_name.to_string()));
        Ok(())
    }

    fn pop_frames(&self, thread: ThreadId, _frame: FrameId) -> TargetResult<()> {
        self.check_connected()?;
        self.record(TargetCall::PopFrames(thread));
        Ok(())
    }

    fn invalidate_caches(&self) {
        self.record(TargetCall::InvalidateCaches);
    }

    fn exit(&self, code: i32) -> TargetResult<()> {
        self.record(TargetCall::Exit(code));
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) -> TargetResult<()> {
        self.record(TargetCall::Dispose);
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestCall {
    ClassPrepared(String),
    CreateStep(ThreadId, StepDepth),
    DeleteSteps(ThreadId),
    ApplyThreadFilter(ThreadId),
    SetRunTo(SourcePosition),
    ClearRunTo(RequestId),
    EnableBreakpoints,
    DisableBreakpoints,
}

/// Recording request subsystem with a configurable requestor.
pub(crate) struct MockRequests {
    calls: Mutex<Vec<RequestCall>>,
    hints: Mutex<HashMap<RequestId, StepHint>>,
    next_id: AtomicI32,
    requestor: Mutex<Option<Arc<dyn Requestor>>>,
}

impl MockRequests {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            hints: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            requestor: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> Vec<RequestCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn set_requestor(&self, requestor: Arc<dyn Requestor>) {
        *self.requestor.lock() = Some(requestor);
    }

    pub(crate) fn last_step_request(&self) -> Option<RequestId> {
        let hints = self.hints.lock();
        hints.keys().max().copied()
    }
}

impl RequestSubsystem for MockRequests {
    fn find_requestor_for(&self, _event: &Event) -> Option<Arc<dyn Requestor>> {
        self.requestor.lock().clone()
    }

    fn class_prepared(&self, event: &Event) {
        if let crate::events::EventKind::ClassPrepare { type_name, .. } = &event.kind {
            self.calls
                .lock()
                .push(RequestCall::ClassPrepared(type_name.clone()));
        }
    }

    fn create_step_request(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        _policy: SuspendPolicy,
        hint: StepHint,
    ) -> TargetResult<RequestId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().insert(id, hint);
        self.calls.lock().push(RequestCall::CreateStep(thread, depth));
        Ok(id)
    }

    fn delete_step_requests(&self, thread: ThreadId) -> TargetResult<()> {
        self.hints.lock().clear();
        self.calls.lock().push(RequestCall::DeleteSteps(thread));
        Ok(())
    }

    fn step_hint_for(&self, request: RequestId) -> Option<StepHint> {
        self.hints.lock().get(&request).cloned()
    }

    fn apply_thread_filter(&self, thread: ThreadId) {
        self.calls.lock().push(RequestCall::ApplyThreadFilter(thread));
    }

    fn set_run_to_location(&self, position: &SourcePosition) -> TargetResult<RequestId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(RequestCall::SetRunTo(position.clone()));
        Ok(id)
    }

    fn clear_run_to_location(&self, request: RequestId) {
        self.calls.lock().push(RequestCall::ClearRunTo(request));
    }

    fn enable_breakpoints(&self) {
        self.calls.lock().push(RequestCall::EnableBreakpoints);
    }

    fn disable_breakpoints(&self) {
        self.calls.lock().push(RequestCall::DisableBreakpoints);
    }
}

/// Requestor with a fixed resume verdict.
pub(crate) struct ScriptedRequestor {
    resume: bool,
    hits: AtomicUsize,
}

impl ScriptedRequestor {
    pub(crate) fn new(resume: bool) -> Self {
        Self {
            resume,
            hits: AtomicUsize::new(0),
        }
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Requestor for ScriptedRequestor {
    fn should_resume(&self, _ctx: &SuspendContext, _event: &Event) -> bool {
        self.resume
    }

    fn notify_hit(&self, _event: &Event) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener that records notifications in arrival order.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.events.lock().iter().any(|e| e == needle)
    }
}

impl SessionListener for RecordingListener {
    fn on_attached(&self) {
        self.events.lock().push("attached".to_string());
    }

    fn on_detached(&self, closed_by_user: bool) {
        self.events
            .lock()
            .push(format!("detached({})", closed_by_user));
    }

    fn on_paused(&self, ctx: &Arc<SuspendContext>) {
        self.events.lock().push(format!("paused(#{})", ctx.id()));
    }

    fn on_resumed(&self, ctx: &Arc<SuspendContext>) {
        self.events.lock().push(format!("resumed(#{})", ctx.id()));
    }

    fn on_evaluation_started(&self, _ctx: &Arc<SuspendContext>) {
        self.events.lock().push("eval-started".to_string());
    }

    fn on_evaluation_finished(&self, _ctx: &Arc<SuspendContext>) {
        self.events.lock().push("eval-finished".to_string());
    }
}

/// A session wired to mocks, plus handles to everything the tests observe.
pub(crate) struct TestHarness {
    pub(crate) target: Arc<MockTarget>,
    pub(crate) requests: Arc<MockRequests>,
    pub(crate) listener: Arc<RecordingListener>,
    pub(crate) session: Arc<DebugSession>,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        let config = SessionConfig::default();
        init_tracing();
        let target = Arc::new(MockTarget::new(vec![1, 2, 3]));
        let requests = Arc::new(MockRequests::new());
        let listener = Arc::new(RecordingListener::default());
        let session = DebugSession::new(
            Arc::clone(&target) as Arc<dyn TargetHandle>,
            Arc::clone(&requests) as Arc<dyn RequestSubsystem>,
            config,
        );
        session.add_listener(Arc::clone(&listener) as Arc<dyn SessionListener>);
        Self {
            target,
            requests,
            listener,
            session,
        }
    }

    pub(crate) fn attached() -> Self {
        let harness = Self::new();
        harness.session.attach();
        harness.barrier();
        harness
    }

    /// Wait until every command enqueued so far has executed.
    pub(crate) fn barrier(&self) {
        self.session
            .manager()
            .invoke_and_wait(DebuggerCommand::new(Priority::Normal, || Ok(())));
    }

    /// Run a closure on the manager thread and wait for it.
    pub(crate) fn on_manager(&self, f: impl FnOnce() -> TargetResult<()> + Send + 'static) {
        self.session
            .manager()
            .invoke_and_wait(DebuggerCommand::new(Priority::Normal, f));
    }

    /// Poll until `predicate` holds; panics after five seconds. Used for
    /// state that the event pump reaches asynchronously.
    pub(crate) fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {}", what);
    }
}
