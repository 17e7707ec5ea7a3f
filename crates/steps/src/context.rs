//! Execution context carried by every orchestration message.
//!
//! Defined here (in the steps crate) so both the engine and individual step
//! implementations can import it without a circular dependency.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Status of a run, phase or step.
///
/// Progression is monotonic: `Pending → InProgress → {Complete | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

impl ExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Complete | Self::Error => 2,
        }
    }

    /// `true` once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` respects the monotonic order.
    pub fn can_advance_to(self, next: ExecutionStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETE" => Ok(Self::Complete),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Contextual information passed along the flow of execution.
///
/// `run_index` is assigned at submission and is at least 1.  `phase_index`
/// and `step_index` start at 0 and are only ever advanced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Name of the network under test, e.g. `LOC-01`.
    pub network: String,
    /// Type of workload, e.g. `WG-100`.
    pub run_type: String,
    /// Disambiguates multiple runs of the same workload type.
    pub run_index: u32,
    /// Current phase (1-based once started, 0 before).
    pub phase_index: u32,
    /// Current step within the phase (1-based once started, 0 before).
    pub step_index: u32,
    /// Workload specific arguments.
    #[serde(default)]
    pub args: Value,
    /// Node to which deploys are dispatched.
    #[serde(default)]
    pub node_index: u32,
    /// Run status as last persisted by the engine.
    pub status: ExecutionStatus,
}

impl ExecutionContext {
    pub fn new(
        network: impl Into<String>,
        run_type: impl Into<String>,
        run_index: u32,
        args: Value,
    ) -> Self {
        Self {
            network: network.into(),
            run_type: run_type.into(),
            run_index,
            phase_index: 0,
            step_index: 0,
            args,
            node_index: 0,
            status: ExecutionStatus::Pending,
        }
    }

    pub fn with_node_index(mut self, node_index: u32) -> Self {
        self.node_index = node_index;
        self
    }

    pub fn run_index_label(&self) -> String {
        format!("R-{:03}", self.run_index)
    }

    pub fn phase_index_label(&self) -> String {
        format!("P-{:02}", self.phase_index)
    }

    pub fn step_index_label(&self) -> String {
        format!("S-{:02}", self.step_index)
    }

    /// Reads an unsigned integer argument, e.g. `user_accounts`.
    pub fn arg_u64(&self, name: &str) -> Option<u64> {
        self.args.get(name).and_then(Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn labels_are_zero_padded() {
        let mut ctx = ExecutionContext::new("LOC-01", "WG-100", 7, json!({}));
        ctx.phase_index = 2;
        ctx.step_index = 11;
        assert_eq!(ctx.run_index_label(), "R-007");
        assert_eq!(ctx.phase_index_label(), "P-02");
        assert_eq!(ctx.step_index_label(), "S-11");
    }

    #[test]
    fn status_never_regresses() {
        use ExecutionStatus::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Complete));
        assert!(InProgress.can_advance_to(Error));
        assert!(!Complete.can_advance_to(InProgress));
        assert!(!Complete.can_advance_to(Error));
        assert!(!Error.can_advance_to(Complete));
        assert!(!InProgress.can_advance_to(InProgress));
    }
}
