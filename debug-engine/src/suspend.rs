// Suspend manager
//
// Owns the stacks of suspend contexts, the per-thread freeze set, and the
// vote-counting protocol that decides whether a context auto-resumes or
// becomes a user-visible pause. All mutation happens on the manager thread;
// the interior locks are carriers, not the synchronization mechanism.

use crate::error::{TargetError, TargetResult};
use crate::events::EventSet;
use crate::target::TargetHandle;
use crate::types::{SuspendPolicy, ThreadId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One-time outcome of a fully voted context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Resumed,
    Paused,
}

#[derive(Debug)]
struct VoteState {
    remaining: u32,
    voted_for_resume: bool,
    resolution: Option<Resolved>,
}

/// Represents the pause caused by one event set (or created synthetically by
/// pause, stepping, or a frame pop).
///
/// Exclusively owned by the suspend manager; commands borrow a reference
/// while they execute.
pub struct SuspendContext {
    id: u64,
    policy: SuspendPolicy,
    thread: Mutex<Option<ThreadId>>,
    votes: Mutex<VoteState>,
    resumed_threads: Mutex<HashSet<ThreadId>>,
    evaluating: Mutex<Option<ThreadId>>,
    in_progress: Mutex<bool>,
}

impl SuspendContext {
    fn new(id: u64, policy: SuspendPolicy, votes: u32, thread: Option<ThreadId>) -> Self {
        Self {
            id,
            policy,
            thread: Mutex::new(thread),
            votes: Mutex::new(VoteState {
                remaining: votes,
                voted_for_resume: true,
                resolution: None,
            }),
            resumed_threads: Mutex::new(HashSet::new()),
            evaluating: Mutex::new(None),
            in_progress: Mutex::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.policy
    }

    /// The thread this pause is anchored to (first event's thread, or none)
    pub fn anchor_thread(&self) -> Option<ThreadId> {
        *self.thread.lock()
    }

    pub(crate) fn set_anchor_thread(&self, thread: Option<ThreadId>) {
        *self.thread.lock() = thread;
    }

    /// Whether this context currently keeps `thread` suspended
    pub fn suspends(&self, thread: ThreadId) -> bool {
        if self.is_resumed() {
            return false;
        }
        match self.policy {
            SuspendPolicy::All => !self.resumed_threads.lock().contains(&thread),
            SuspendPolicy::EventThread => self.anchor_thread() == Some(thread),
            SuspendPolicy::None => false,
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.votes.lock().resolution == Some(Resolved::Resumed)
    }

    pub fn is_paused(&self) -> bool {
        self.votes.lock().resolution == Some(Resolved::Paused)
    }

    /// Non-empty while a blocking call is outstanding inside this context
    pub fn evaluating_thread(&self) -> Option<ThreadId> {
        *self.evaluating.lock()
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating.lock().is_some()
    }

    pub(crate) fn set_evaluating(&self, thread: Option<ThreadId>) {
        *self.evaluating.lock() = thread;
    }

    /// True only while a command that owns this context is executing
    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.lock()
    }

    pub(crate) fn set_in_progress(&self, value: bool) {
        *self.in_progress.lock() = value;
    }

    pub(crate) fn resumed_threads(&self) -> HashSet<ThreadId> {
        self.resumed_threads.lock().clone()
    }
}

impl std::fmt::Debug for SuspendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendContext")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("thread", &self.anchor_thread())
            .finish()
    }
}

/// Snapshot of the state `prepare_for_resume` disturbs, so evaluation can
/// restore it exactly
#[derive(Debug)]
pub struct ResumeData {
    was_frozen: bool,
    resumed_threads: HashSet<ThreadId>,
}

struct Inner {
    event_contexts: Vec<Arc<SuspendContext>>,
    paused_contexts: Vec<Arc<SuspendContext>>,
    frozen: HashSet<ThreadId>,
    /// Live-context counter: pushes minus pops, never negative
    suspends: usize,
    next_context_id: u64,
}

pub struct SuspendManager {
    target: Arc<dyn TargetHandle>,
    inner: Mutex<Inner>,
    resume_attempts: usize,
}

impl SuspendManager {
    pub fn new(target: Arc<dyn TargetHandle>, resume_attempts: usize) -> Self {
        Self {
            target,
            inner: Mutex::new(Inner {
                event_contexts: Vec::new(),
                paused_contexts: Vec::new(),
                frozen: HashSet::new(),
                suspends: 0,
                next_context_id: 1,
            }),
            resume_attempts: resume_attempts.max(1),
        }
    }

    /// Create a context with a custom vote count and push it onto the
    /// event-contexts stack.
    pub fn push_suspend_context(
        &self,
        policy: SuspendPolicy,
        votes: u32,
        thread: Option<ThreadId>,
    ) -> Arc<SuspendContext> {
        let mut inner = self.inner.lock();
        let id = inner.next_context_id;
        inner.next_context_id += 1;
        let ctx = Arc::new(SuspendContext::new(id, policy, votes, thread));
        inner.event_contexts.push(Arc::clone(&ctx));
        inner.suspends += 1;
        debug!("pushed suspend context #{} ({} live)", id, inner.suspends);
        ctx
    }

    /// Create a context for one event set; the vote count is the set size and
    /// the anchor thread is the first event's thread.
    pub fn push_context_for(&self, set: &EventSet) -> Arc<SuspendContext> {
        self.push_suspend_context(set.suspend_policy, set.events.len() as u32, set.anchor_thread())
    }

    /// Record one resume vote. Returns the resolution if this was the last
    /// vote; the caller publishes any resulting pause notification.
    pub fn vote_resume(&self, ctx: &Arc<SuspendContext>) -> TargetResult<Option<Resolved>> {
        self.vote(ctx, true)
    }

    /// Record one suspend vote; clears the resume disposition permanently.
    pub fn vote_suspend(&self, ctx: &Arc<SuspendContext>) -> TargetResult<Option<Resolved>> {
        self.vote(ctx, false)
    }

    fn vote(&self, ctx: &Arc<SuspendContext>, resume: bool) -> TargetResult<Option<Resolved>> {
        if ctx.is_evaluating() {
            error!("voting on context #{} while it is evaluating", ctx.id());
            return Ok(None);
        }
        let resolved = {
            let mut votes = ctx.votes.lock();
            if votes.resolution.is_some() || votes.remaining == 0 {
                error!("vote on already-resolved context #{}", ctx.id());
                return Ok(None);
            }
            votes.remaining -= 1;
            if !resume {
                votes.voted_for_resume = false;
            }
            if votes.remaining > 0 {
                return Ok(None);
            }
            let resolution = if votes.voted_for_resume {
                Resolved::Resumed
            } else {
                Resolved::Paused
            };
            votes.resolution = Some(resolution);
            resolution
        };
        match resolved {
            Resolved::Resumed => {
                self.pop_context(ctx);
                self.run_resume_strategy(ctx)?;
                Ok(Some(Resolved::Resumed))
            }
            Resolved::Paused => {
                self.inner.lock().paused_contexts.push(Arc::clone(ctx));
                debug!("context #{} resolved to paused", ctx.id());
                Ok(Some(Resolved::Paused))
            }
        }
    }

    /// Resume a fully voted (paused) or synthetic context and pop it.
    pub fn resume(&self, ctx: &Arc<SuspendContext>) -> TargetResult<()> {
        if ctx.is_evaluating() {
            error!("resuming context #{} while it is evaluating", ctx.id());
            return Ok(());
        }
        {
            let mut votes = ctx.votes.lock();
            if votes.resolution == Some(Resolved::Resumed) {
                error!("context #{} resumed twice", ctx.id());
                return Ok(());
            }
            votes.resolution = Some(Resolved::Resumed);
        }
        self.pop_context(ctx);
        self.run_resume_strategy(ctx)
    }

    fn pop_context(&self, ctx: &Arc<SuspendContext>) {
        let mut inner = self.inner.lock();
        let before = inner.event_contexts.len();
        inner.event_contexts.retain(|c| !Arc::ptr_eq(c, ctx));
        inner.paused_contexts.retain(|c| !Arc::ptr_eq(c, ctx));
        if inner.event_contexts.len() == before {
            error!("popping context #{} that is not live", ctx.id());
            return;
        }
        inner.suspends -= 1;
        debug!("popped suspend context #{} ({} live)", ctx.id(), inner.suspends);
    }

    /// Run the context's resume strategy: whole-process resume, single-thread
    /// resume, or nothing, depending on the event set's policy. Retries a
    /// bounded number of times on benign target contention.
    fn run_resume_strategy(&self, ctx: &Arc<SuspendContext>) -> TargetResult<()> {
        match ctx.suspend_policy() {
            SuspendPolicy::All => {
                // Threads resumed out-of-band already gave back their event
                // suspension; re-suspend them so the whole-process resume
                // stays balanced.
                let resumed: Vec<ThreadId> = ctx.resumed_threads.lock().drain().collect();
                for thread in resumed {
                    self.target.suspend_thread(thread)?;
                }
                self.retry_resume(|| self.target.resume_all())
            }
            SuspendPolicy::EventThread => match ctx.anchor_thread() {
                Some(thread) => self.retry_resume(|| self.target.resume_thread(thread)),
                None => Ok(()),
            },
            SuspendPolicy::None => Ok(()),
        }
    }

    fn retry_resume(&self, mut resume: impl FnMut() -> TargetResult<()>) -> TargetResult<()> {
        let mut last = None;
        for attempt in 1..=self.resume_attempts {
            match resume() {
                Ok(()) => return Ok(()),
                Err(TargetError::InternalContention(code)) => {
                    debug!("resume contention (code {}), attempt {}", code, attempt);
                    last = Some(TargetError::InternalContention(code));
                }
                Err(other) => return Err(other),
            }
        }
        let err = last.unwrap_or(TargetError::Unsupported("resume".into()));
        warn!("giving up on resume after {} attempts: {}", self.resume_attempts, err);
        Err(err)
    }

    /// Resume a thread other than the context's anchor out-of-band, recording
    /// it so the context's own resume stays balanced.
    pub fn resume_thread(&self, ctx: &Arc<SuspendContext>, thread: ThreadId) -> TargetResult<()> {
        if ctx.anchor_thread() == Some(thread) {
            error!("out-of-band resume of anchor thread {} (use context resume)", thread);
            return Ok(());
        }
        if ctx.resumed_threads.lock().insert(thread) {
            self.target.resume_thread(thread)?;
        }
        Ok(())
    }

    /// Undo an out-of-band resume.
    pub fn suspend_thread(&self, ctx: &Arc<SuspendContext>, thread: ThreadId) -> TargetResult<()> {
        if ctx.anchor_thread() == Some(thread) {
            error!("out-of-band suspend of anchor thread {}", thread);
            return Ok(());
        }
        if ctx.resumed_threads.lock().remove(&thread) {
            self.target.suspend_thread(thread)?;
        }
        Ok(())
    }

    /// Freeze a thread independently of any context. Pairs with exactly one
    /// target-level suspend.
    pub fn freeze_thread(&self, thread: ThreadId) -> TargetResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.frozen.insert(thread) {
                error!("thread {} is already frozen", thread);
                return Ok(());
            }
        }
        self.target.suspend_thread(thread)
    }

    pub fn unfreeze_thread(&self, thread: ThreadId) -> TargetResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.frozen.remove(&thread) {
                error!("thread {} is not frozen", thread);
                return Ok(());
            }
        }
        self.target.resume_thread(thread)
    }

    pub fn is_frozen(&self, thread: ThreadId) -> bool {
        self.inner.lock().frozen.contains(&thread)
    }

    /// Whether any live context or the freeze set keeps `thread` suspended
    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        if self.is_frozen(thread) {
            return true;
        }
        self.inner
            .lock()
            .event_contexts
            .iter()
            .any(|c| c.suspends(thread))
    }

    /// Live contexts currently suspending `thread`
    pub fn suspending_contexts(&self, thread: ThreadId) -> Vec<Arc<SuspendContext>> {
        self.inner
            .lock()
            .event_contexts
            .iter()
            .filter(|c| c.suspends(thread))
            .cloned()
            .collect()
    }

    pub fn event_contexts(&self) -> Vec<Arc<SuspendContext>> {
        self.inner.lock().event_contexts.clone()
    }

    pub fn paused_contexts(&self) -> Vec<Arc<SuspendContext>> {
        self.inner.lock().paused_contexts.clone()
    }

    pub fn has_paused_context(&self) -> bool {
        !self.inner.lock().paused_contexts.is_empty()
    }

    /// The paused context anchored to `thread`, if any
    pub fn find_paused_by_thread(&self, thread: ThreadId) -> Option<Arc<SuspendContext>> {
        self.inner
            .lock()
            .paused_contexts
            .iter()
            .rev()
            .find(|c| c.anchor_thread() == Some(thread))
            .cloned()
    }

    /// Whether some live context is evaluating on `thread`
    pub fn is_evaluating_on(&self, thread: ThreadId) -> bool {
        self.inner
            .lock()
            .event_contexts
            .iter()
            .any(|c| c.evaluating_thread() == Some(thread))
    }

    /// Live-context counter, for bookkeeping checks
    pub fn suspends_count(&self) -> usize {
        self.inner.lock().suspends
    }

    /// Mark a synthetic (zero-vote) context paused and publish it on the
    /// paused stack. The caller emits the notification.
    pub fn push_paused(&self, ctx: &Arc<SuspendContext>) {
        {
            let mut votes = ctx.votes.lock();
            if votes.resolution.is_some() {
                error!("publishing already-resolved context #{}", ctx.id());
                return;
            }
            votes.resolution = Some(Resolved::Paused);
        }
        self.inner.lock().paused_contexts.push(Arc::clone(ctx));
    }

    /// Pop the context and immediately re-push a zero-vote context anchored
    /// to the same thread, published as paused. Re-enters a stopped state
    /// after a stack-frame pop without waiting for a new target event.
    pub fn pop_frame(&self, ctx: &Arc<SuspendContext>) -> Arc<SuspendContext> {
        let thread = ctx.anchor_thread();
        {
            let mut votes = ctx.votes.lock();
            votes.resolution = Some(Resolved::Resumed);
        }
        self.pop_context(ctx);
        let new_ctx = self.push_suspend_context(ctx.suspend_policy(), 0, thread);
        self.push_paused(&new_ctx);
        new_ctx
    }

    /// Snapshot and lift the state that would block an evaluation on the
    /// context's anchor thread: the freeze flag and the resumed-thread set.
    pub fn prepare_for_resume(&self, ctx: &Arc<SuspendContext>) -> ResumeData {
        let data = ResumeData {
            was_frozen: ctx
                .anchor_thread()
                .map(|t| self.is_frozen(t))
                .unwrap_or(false),
            resumed_threads: ctx.resumed_threads(),
        };
        if data.was_frozen {
            if let Some(thread) = ctx.anchor_thread() {
                if let Err(e) = self.unfreeze_thread(thread) {
                    warn!("failed to unfreeze thread {} before evaluation: {}", thread, e);
                }
            }
        }
        data
    }

    /// Restore the exact freeze state and resumed-thread set captured by
    /// `prepare_for_resume`.
    pub fn restore_after_resume(&self, ctx: &Arc<SuspendContext>, data: ResumeData) {
        if data.was_frozen {
            if let Some(thread) = ctx.anchor_thread() {
                if !self.is_frozen(thread) {
                    if let Err(e) = self.freeze_thread(thread) {
                        warn!("failed to re-freeze thread {} after evaluation: {}", thread, e);
                    }
                }
            }
        }
        *ctx.resumed_threads.lock() = data.resumed_threads;
    }
}
