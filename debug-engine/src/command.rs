// Debugger commands
//
// One command representation for every operation: a priority, an action
// closure, an optional cancellation callback, and an optional bound suspend
// context. Behavior varies by the closure, not by a type hierarchy.

use crate::error::TargetResult;
use crate::suspend::SuspendContext;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

type Action = Box<dyn FnOnce() -> TargetResult<()> + Send + 'static>;
type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work for the manager thread.
pub struct DebuggerCommand {
    priority: Priority,
    action: Action,
    on_cancel: Option<Callback>,
    on_finish: Option<Callback>,
    context: Option<Arc<SuspendContext>>,
}

impl DebuggerCommand {
    pub fn new(
        priority: Priority,
        action: impl FnOnce() -> TargetResult<()> + Send + 'static,
    ) -> Self {
        Self {
            priority,
            action: Box::new(action),
            on_cancel: None,
            on_finish: None,
            context: None,
        }
    }

    /// Callback invoked instead of the action if the queue is closed before
    /// the command runs, or if its bound context no longer exists.
    pub fn on_cancel(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(callback));
        self
    }

    /// Bind the command to a suspend context. The command is dropped if the
    /// context has been resumed by the time it runs, and the context is
    /// marked in-progress while the action executes.
    pub fn bound_to(mut self, context: Arc<SuspendContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Callback fired after the command either runs or is cancelled.
    pub(crate) fn notify_on_finish(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub(crate) fn into_high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn run(self) {
        let Self {
            priority: _,
            action,
            on_cancel,
            on_finish,
            context,
        } = self;

        if let Some(ctx) = &context {
            if ctx.is_resumed() {
                debug!("dropping command bound to resumed context #{}", ctx.id());
                if let Some(cancel) = on_cancel {
                    cancel();
                }
                if let Some(finish) = on_finish {
                    finish();
                }
                return;
            }
            ctx.set_in_progress(true);
        }

        let result = action();

        if let Some(ctx) = &context {
            ctx.set_in_progress(false);
        }

        match result {
            Ok(()) => {}
            // expected while the session is tearing down
            Err(e) if e.is_disconnect() => debug!("command aborted by disconnect: {}", e),
            Err(e) => error!("command failed: {}", e),
        }

        if let Some(finish) = on_finish {
            finish();
        }
    }

    pub(crate) fn cancel(self) {
        if let Some(cancel) = self.on_cancel {
            cancel();
        }
        if let Some(finish) = self.on_finish {
            finish();
        }
    }
}

impl std::fmt::Debug for DebuggerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerCommand")
            .field("priority", &self.priority)
            .field("context", &self.context.as_ref().map(|c| c.id()))
            .finish()
    }
}
