//! Engine-level error types.

use steps::{StepError, VerificationError};
use thiserror::Error;

/// Errors produced by the orchestration engine.
///
/// Most domain kinds are *drops*: the transition is logged and discarded
/// without touching state.  Step failures and fatal verification failures
/// escalate through the error cascade.  Infrastructure errors propagate to
/// the worker so the delivery is retried.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition errors ------

    /// No workflow is registered for the run type.
    #[error("unknown workflow: '{0}'")]
    UnknownWorkflow(String),

    /// The workflow has no phases, or a phase has no steps.
    #[error("invalid workflow definition '{run_type}': {reason}")]
    InvalidDefinition { run_type: String, reason: String },

    // ------ Transition guards ------

    /// Another delivery already claimed this transition.
    #[error("lock not acquired: {key}")]
    LockNotAcquired { key: String },

    /// Phase or step index beyond the workflow definition.
    #[error("{aspect} index {index} out of bounds (count {count})")]
    OutOfBounds {
        aspect: &'static str,
        index: u32,
        count: usize,
    },

    /// The target is not exactly one past the persisted position.
    #[error("stale transition to {target}: persisted position is {persisted}")]
    StaleTransition { target: String, persisted: String },

    /// The run has already failed; in-flight transitions are discarded.
    #[error("run {run} is halted")]
    RunHalted { run: String },

    // ------ Step errors ------

    #[error("step '{label}' failed: {source}")]
    StepExecution {
        label: String,
        #[source]
        source: StepError,
    },

    #[error("step '{label}': {source}")]
    Verification {
        label: String,
        #[source]
        source: VerificationError,
    },

    // ------ Infrastructure ------

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error means "discard this transition" rather than fail it.
    pub fn is_drop(&self) -> bool {
        match self {
            Self::UnknownWorkflow(_)
            | Self::InvalidDefinition { .. }
            | Self::LockNotAcquired { .. }
            | Self::OutOfBounds { .. }
            | Self::StaleTransition { .. }
            | Self::RunHalted { .. } => true,
            Self::Verification { source, .. } => source.is_ignorable(),
            _ => false,
        }
    }

    /// Whether the error came from the store, queue or codec layer.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Queue(_) | Self::Codec(_))
    }
}
