//! Persisted execution records.
//!
//! One `ExecutionInfo` is kept per run, per phase and per step.  These are
//! the records operators inspect; the `ExecutionContext` is the record the
//! engine itself advances.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steps::{ExecutionContext, ExecutionStatus};

// ---------------------------------------------------------------------------
// ExecutionAspect
// ---------------------------------------------------------------------------

/// Which level of a run a record or lock refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionAspect {
    Run,
    Phase,
    Step,
}

impl fmt::Display for ExecutionAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Phase => write!(f, "phase"),
            Self::Step => write!(f, "step"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionInfo
// ---------------------------------------------------------------------------

/// Status record of a run, phase or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub network: String,
    pub run_type: String,
    pub run_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_label: Option<String>,
    pub status: ExecutionStatus,
    pub ts_start: DateTime<Utc>,
    #[serde(default)]
    pub ts_end: Option<DateTime<Utc>>,
    /// Milliseconds between start and end, set once terminal.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionInfo {
    /// A fresh PENDING record.
    fn pending(ctx: &ExecutionContext, phase: Option<u32>, step: Option<u32>) -> Self {
        Self {
            network: ctx.network.clone(),
            run_type: ctx.run_type.clone(),
            run_index: ctx.run_index,
            phase_index: phase,
            step_index: step,
            step_label: None,
            status: ExecutionStatus::Pending,
            ts_start: Utc::now(),
            ts_end: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn for_run(ctx: &ExecutionContext) -> Self {
        Self::pending(ctx, None, None)
    }

    pub fn for_phase(ctx: &ExecutionContext) -> Self {
        Self::pending(ctx, Some(ctx.phase_index), None)
    }

    pub fn for_step(ctx: &ExecutionContext, label: impl Into<String>) -> Self {
        let mut info = Self::pending(ctx, Some(ctx.phase_index), Some(ctx.step_index));
        info.step_label = Some(label.into());
        info
    }

    pub fn aspect(&self) -> ExecutionAspect {
        match (self.phase_index, self.step_index) {
            (Some(_), Some(_)) => ExecutionAspect::Step,
            (Some(_), None) => ExecutionAspect::Phase,
            _ => ExecutionAspect::Run,
        }
    }

    /// Move to a terminal status, stamping end time and duration.
    pub fn finalise(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.ts_end = Some(now);
        self.duration_ms = Some((now - self.ts_start).num_milliseconds());
        self.error = error;
    }

    /// `P-##.S-##` address of a step record.
    pub fn address(&self) -> String {
        match (self.phase_index, self.step_index) {
            (Some(p), Some(s)) => format!("P-{p:02}.S-{s:02}"),
            (Some(p), None) => format!("P-{p:02}"),
            _ => "-".to_owned(),
        }
    }
}
