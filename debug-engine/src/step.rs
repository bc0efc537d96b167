// Step hint
//
// Per-step decision state. One hint exists per outstanding step request; it
// is consulted exactly once per intermediate step event and decides whether
// to keep stepping automatically or to stop and present a pause. The
// decision function is a pure read of target state and fails safe to Stop.

use crate::target::TargetHandle;
use crate::types::{MethodInfo, SourcePosition, StepDepth, ThreadId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome of consulting a step hint for one step event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    /// Present this position as a pause
    Stop,
    /// Issue a new step request with the given depth and keep going
    Continue(StepDepth),
}

/// Filter toggles for automatic stepping, owned by the session config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFilters {
    pub skip_synthetic: bool,
    pub skip_getters: bool,
    pub skip_constructors: bool,
    pub skip_class_loaders: bool,
}

impl Default for StepFilters {
    fn default() -> Self {
        Self {
            skip_synthetic: true,
            skip_getters: false,
            skip_constructors: false,
            skip_class_loaders: true,
        }
    }
}

/// Target-signature filter for smart step-into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFilter {
    pub declaring_type: String,
    pub name: String,
    /// `None` matches any overload
    pub signature: Option<String>,
}

impl MethodFilter {
    pub fn matches(&self, method: &MethodInfo) -> bool {
        if method.declaring_type != self.declaring_type || method.name != self.name {
            return false;
        }
        match &self.signature {
            Some(signature) => *signature == method.signature,
            None => true,
        }
    }
}

/// Decision state for one outstanding step request.
///
/// Anchored at the source position and stack depth present when the step was
/// issued; superseded when a new step command is issued for the thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHint {
    depth: StepDepth,
    position: Option<SourcePosition>,
    frame_count: usize,
    ignore_filters: bool,
    restore_breakpoints: bool,
    skip_this_method: bool,
    smart_filter: Option<MethodFilter>,
}

impl StepHint {
    /// Capture the anchor position and stack depth for a step about to be
    /// issued on `thread`.
    pub fn capture(depth: StepDepth, target: &dyn TargetHandle, thread: ThreadId) -> Self {
        let position = target.current_position(thread).ok().flatten();
        let frame_count = target.frame_count(thread).unwrap_or(0);
        Self {
            depth,
            position,
            frame_count,
            ignore_filters: false,
            restore_breakpoints: false,
            skip_this_method: false,
            smart_filter: None,
        }
    }

    pub fn depth(&self) -> StepDepth {
        self.depth
    }

    pub fn is_ignore_filters(&self) -> bool {
        self.ignore_filters
    }

    pub fn set_ignore_filters(&mut self, value: bool) {
        self.ignore_filters = value;
    }

    pub fn is_restore_breakpoints(&self) -> bool {
        self.restore_breakpoints
    }

    pub fn set_restore_breakpoints(&mut self, value: bool) {
        self.restore_breakpoints = value;
    }

    pub fn set_skip_this_method(&mut self, value: bool) {
        self.skip_this_method = value;
    }

    pub fn set_smart_filter(&mut self, filter: Option<MethodFilter>) {
        self.smart_filter = filter;
    }

    /// Decide what to do about one intermediate step event.
    ///
    /// Pure read of target state; any evaluation fault or disconnect fails
    /// safe to `Stop`.
    pub fn next_step_decision(
        &self,
        target: &dyn TargetHandle,
        thread: ThreadId,
        filters: &StepFilters,
    ) -> StepDecision {
        match self.decide(target, thread, filters) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("step decision failed, stopping: {}", e);
                StepDecision::Stop
            }
        }
    }

    fn decide(
        &self,
        target: &dyn TargetHandle,
        thread: ThreadId,
        filters: &StepFilters,
    ) -> crate::error::TargetResult<StepDecision> {
        let frame_count = target.frame_count(thread)?;
        let position = target.current_position(thread)?;

        let same_position = match (&self.position, &position) {
            (Some(anchor), Some(current)) => anchor == current,
            _ => false,
        };
        if same_position && frame_count == self.frame_count {
            // still inside the original statement: keep stepping as requested
            return Ok(StepDecision::Continue(self.depth));
        }

        if self.depth == StepDepth::Into && !self.ignore_filters {
            let method = target.method_at(thread)?;
            if self.should_skip(&method, filters) {
                debug!("filtered method {}.{}, stepping out", method.declaring_type, method.name);
                return Ok(StepDecision::Continue(StepDepth::Out));
            }
            if let Some(filter) = &self.smart_filter {
                let deeper = frame_count > self.frame_count;
                if filter.matches(&method) && (!self.skip_this_method || deeper) {
                    return Ok(StepDecision::Stop);
                }
                return Ok(StepDecision::Continue(StepDepth::Out));
            }
        }

        Ok(StepDecision::Stop)
    }

    fn should_skip(&self, method: &MethodInfo, filters: &StepFilters) -> bool {
        (filters.skip_synthetic && method.is_synthetic)
            || (filters.skip_getters && method.is_getter)
            || (filters.skip_constructors && method.is_constructor)
            || (filters.skip_class_loaders && method.is_class_loading)
    }
}
