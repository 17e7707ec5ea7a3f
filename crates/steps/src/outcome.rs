//! What a step hands back to the engine after `execute`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work dispatched as part of a batch.
///
/// The engine routes it back to the step that produced it through
/// [`crate::Step::execute_sub_operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOperation {
    /// Step-defined discriminator, e.g. `fund-account`.
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

impl SubOperation {
    pub fn new(kind: impl Into<String>, args: Value) -> Self {
        Self { kind: kind.into(), args }
    }
}

/// A set of sub-operations to dispatch concurrently.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub operations: Vec<SubOperation>,
    /// Dispatch is jittered uniformly across this window when set.
    pub dispatch_window: Option<Duration>,
}

impl Batch {
    pub fn new(operations: Vec<SubOperation>) -> Self {
        Self { operations, dispatch_window: None }
    }

    /// Spread dispatch of the batch across `window`.
    pub fn within(mut self, window: Duration) -> Self {
        self.dispatch_window = Some(window);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing further to dispatch.
    Done,
    /// Sub-operations the engine must dispatch on the step's behalf.
    Batch(Batch),
}

impl StepOutcome {
    pub fn batch(operations: Vec<SubOperation>) -> Self {
        Self::Batch(Batch::new(operations))
    }
}
