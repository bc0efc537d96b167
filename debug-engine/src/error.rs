// Error taxonomy
//
// Protocol faults come from the target handle and are recovered locally
// (bounded retry) or treated as terminal (disconnect). Evaluation faults are
// wrapped uniformly and surfaced to the caller of evaluate.

use crate::types::ThreadId;
use thiserror::Error;

pub type TargetResult<T> = Result<T, TargetError>;

/// Faults surfaced by the target handle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target disconnected")]
    Disconnected,

    /// Benign low-level contention inside the target; resume retries on this
    #[error("internal contention in target (code {0})")]
    InternalContention(i32),

    #[error("invalid thread {0}")]
    InvalidThread(ThreadId),

    #[error("method invocation failed: {0}")]
    InvocationFailed(String),

    #[error("incompatible thread state")]
    IncompatibleThreadState,

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("object has been collected")]
    ObjectCollected,

    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl TargetError {
    /// Disconnects are expected during teardown and are logged quietly
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TargetError::Disconnected)
    }
}

/// Uniform user-facing evaluation fault
#[derive(Debug, Error)]
pub enum EvaluateError {
    /// The anchor thread is already running an evaluation
    #[error("evaluation already in progress on this thread")]
    NestedEvaluation,

    /// The suspend context is missing, resumed, or not executing a command
    #[error("suspend context is not valid for evaluation")]
    ContextInvalid,

    #[error("evaluation failed: {source}")]
    Evaluation {
        #[source]
        source: TargetError,
    },
}

impl EvaluateError {
    pub fn wrap(source: TargetError) -> Self {
        EvaluateError::Evaluation { source }
    }
}
