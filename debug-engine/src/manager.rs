// Manager thread
//
// A single worker thread executes one command at a time in priority+FIFO
// order. Every mutation of session and suspend-manager state funnels through
// here; the invariant is enforced by assertion, not by locking.

use crate::command::{DebuggerCommand, Priority};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

struct QueueState {
    high: VecDeque<DebuggerCommand>,
    normal: VecDeque<DebuggerCommand>,
    closed: bool,
    /// Bumped to retire the current worker; a worker exits when its
    /// generation is stale.
    generation: u64,
    /// Commands started so far; lets the terminate watchdog see whether the
    /// command it observed is still the one executing.
    started: u64,
    /// Execution nesting depth (> 0 while a command runs, counting commands
    /// run inside an evaluation fork).
    running: u32,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
    worker_thread: Mutex<Option<thread::ThreadId>>,
}

impl Shared {
    fn spawn_worker(shared: &Arc<Shared>, generation: u64) {
        let cloned = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("debugger-manager".to_string())
            .spawn(move || Shared::worker_loop(cloned, generation));
        if let Err(e) = spawned {
            error!("failed to spawn manager worker: {}", e);
        }
    }

    fn worker_loop(shared: Arc<Shared>, generation: u64) {
        *shared.worker_thread.lock() = Some(thread::current().id());
        debug!("manager worker started (generation {})", generation);
        loop {
            let cmd = {
                let mut queue = shared.queue.lock();
                loop {
                    if queue.generation != generation {
                        debug!("manager worker retired (generation {})", generation);
                        return;
                    }
                    if let Some(cmd) = Shared::pop(&mut queue) {
                        break cmd;
                    }
                    if queue.closed {
                        debug!("manager worker shutting down");
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            Shared::execute(&shared, cmd);
        }
    }

    fn pop(queue: &mut QueueState) -> Option<DebuggerCommand> {
        queue.high.pop_front().or_else(|| queue.normal.pop_front())
    }

    fn execute(shared: &Arc<Shared>, cmd: DebuggerCommand) {
        {
            let mut queue = shared.queue.lock();
            queue.started += 1;
            queue.running += 1;
        }
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| cmd.run()));
        {
            let mut queue = shared.queue.lock();
            queue.running = queue.running.saturating_sub(1);
        }
        if outcome.is_err() {
            // a fault in one command must not take the queue down
            error!("command panicked; manager thread continues");
        }
    }
}

/// Handle to the serialized command dispatcher.
#[derive(Clone)]
pub struct ManagerThread {
    shared: Arc<Shared>,
}

impl ManagerThread {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                closed: false,
                generation: 0,
                started: 0,
                running: 0,
            }),
            available: Condvar::new(),
            worker_thread: Mutex::new(None),
        });
        Shared::spawn_worker(&shared, 0);
        Self { shared }
    }

    pub fn is_manager_thread(&self) -> bool {
        *self.shared.worker_thread.lock() == Some(thread::current().id())
    }

    /// All suspend-manager mutation and lifecycle transitions must run here.
    pub fn assert_is_manager_thread(&self) {
        if !self.is_manager_thread() {
            error!("not on the manager thread (called from {:?})", thread::current().name());
        }
    }

    /// Run `cmd` synchronously when already on the manager thread (reentrant),
    /// otherwise enqueue it and return immediately.
    pub fn invoke(&self, cmd: DebuggerCommand) {
        if self.is_manager_thread() {
            cmd.run();
        } else {
            self.invoke_later(cmd);
        }
    }

    /// Always enqueue. If the queue is closed, the command's cancellation
    /// callback fires instead of its action.
    pub fn invoke_later(&self, cmd: DebuggerCommand) {
        let rejected = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                Some(cmd)
            } else {
                match cmd.priority() {
                    Priority::High => queue.high.push_back(cmd),
                    Priority::Normal => queue.normal.push_back(cmd),
                }
                self.shared.available.notify_all();
                None
            }
        };
        if let Some(cmd) = rejected {
            debug!("queue closed, cancelling command");
            cmd.cancel();
        }
    }

    /// Block the caller until `cmd` finishes. Callable only from a
    /// non-manager thread; a violation is logged and the command runs
    /// in-line to avoid deadlocking against ourselves.
    pub fn invoke_and_wait(&self, cmd: DebuggerCommand) {
        if self.is_manager_thread() {
            error!("invoke_and_wait called from the manager thread");
            cmd.run();
            return;
        }
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let cmd = cmd.notify_on_finish(move || {
            let _ = tx.send(());
        });
        self.invoke_later(cmd);
        let _ = rx.recv();
    }

    /// Enqueue `cmd` at high priority and, if the command that was executing
    /// when it was enqueued is still executing after `timeout`, restart the
    /// worker. Last-resort shutdown only: the abandoned worker may still
    /// complete the stuck command concurrently.
    pub fn terminate_and_invoke(&self, cmd: DebuggerCommand, timeout: Duration) {
        let observed = {
            let queue = self.shared.queue.lock();
            if queue.running > 0 {
                Some(queue.started)
            } else {
                None
            }
        };
        self.invoke_later(cmd.into_high_priority());
        let Some(observed) = observed else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("debugger-terminator".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                let restart = {
                    let mut queue = shared.queue.lock();
                    if queue.running > 0 && queue.started == observed && !queue.closed {
                        queue.generation += 1;
                        Some(queue.generation)
                    } else {
                        None
                    }
                };
                if let Some(generation) = restart {
                    warn!("command still executing after {:?}, restarting manager worker", timeout);
                    Shared::spawn_worker(&shared, generation);
                }
            });
        if let Err(e) = spawned {
            error!("failed to spawn terminate watchdog: {}", e);
        }
    }

    /// Close the queue. Already-enqueued commands are cancelled; later
    /// submissions are cancelled on arrival.
    pub fn close(&self) {
        let pending: Vec<DebuggerCommand> = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            self.shared.available.notify_all();
            let mut pending: Vec<DebuggerCommand> = queue.high.drain(..).collect();
            pending.extend(queue.normal.drain(..));
            pending
        };
        debug!("closing command queue, cancelling {} pending commands", pending.len());
        for cmd in pending {
            cmd.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Run `work` on a temporary worker thread and block this command's
    /// logical turn on it, while still accepting and running newly queued
    /// commands. The one sanctioned exception to full serialization; used by
    /// the evaluation invoker.
    pub(crate) fn fork_and_wait<T: Send + 'static>(
        &self,
        work: impl FnOnce() -> T + Send + 'static,
    ) -> thread::Result<T> {
        self.assert_is_manager_thread();
        let (tx, rx) = crossbeam_channel::bounded::<thread::Result<T>>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("debugger-eval-worker".to_string())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(work));
                let _ = tx.send(result);
                // take the queue lock so the notification cannot slip between
                // the dispatcher's channel check and its condvar wait
                let _guard = shared.queue.lock();
                shared.available.notify_all();
            });
        if let Err(e) = spawned {
            return Err(Box::new(format!("failed to spawn evaluation worker: {}", e))
                as Box<dyn std::any::Any + Send>);
        }

        loop {
            let next = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                    if let Some(cmd) = Shared::pop(&mut queue) {
                        break Some(cmd);
                    }
                    if queue.closed {
                        break None;
                    }
                    self.shared.available.wait(&mut queue);
                }
            };
            match next {
                Some(cmd) => Shared::execute(&self.shared, cmd),
                // queue closed mid-evaluation: nothing left to drain, just
                // wait for the call to come back so state can be restored
                None => {
                    return rx.recv().unwrap_or_else(|_| {
                        Err(Box::new("evaluation worker vanished".to_string())
                            as Box<dyn std::any::Any + Send>)
                    })
                }
            }
        }
    }
}

impl Default for ManagerThread {
    fn default() -> Self {
        Self::new()
    }
}
