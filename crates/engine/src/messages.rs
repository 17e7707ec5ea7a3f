//! Messages exchanged between workers.
//!
//! Every message carries the context as it was *before* the transition it
//! requests; the handler derives its own target from it.

use serde::{Deserialize, Serialize};
use steps::{DeployFinalized, ExecutionContext, SubOperation};

/// Queue carrying run, phase and step transitions.
pub const ORCHESTRATION_QUEUE: &str = "orchestration";
/// Queue carrying finalized deploy events.
pub const CORRELATOR_QUEUE: &str = "correlator";
/// Queue carrying batch sub-operations.
pub const GENERATORS_QUEUE: &str = "generators";

pub const QUEUES: [&str; 3] = [ORCHESTRATION_QUEUE, CORRELATOR_QUEUE, GENERATORS_QUEUE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestrationMessage {
    DoRun {
        ctx: ExecutionContext,
    },
    DoPhase {
        ctx: ExecutionContext,
    },
    DoStep {
        ctx: ExecutionContext,
    },
    DoStepEnd {
        ctx: ExecutionContext,
    },
    OnPhaseEnd {
        ctx: ExecutionContext,
    },
    OnRunEnd {
        ctx: ExecutionContext,
    },
    DoStepError {
        ctx: ExecutionContext,
        error: String,
    },
    OnPhaseError {
        ctx: ExecutionContext,
        error: String,
    },
    OnRunError {
        ctx: ExecutionContext,
        error: String,
    },
    /// One member of a batch dispatched by the step at `ctx`.
    DoSubOperation {
        ctx: ExecutionContext,
        member: u64,
        op: SubOperation,
        /// Barrier to report to; absent for asynchronous steps.
        #[serde(default)]
        barrier: Option<String>,
    },
    Correlate {
        ctx: ExecutionContext,
        event: DeployFinalized,
    },
}

impl OrchestrationMessage {
    pub fn ctx(&self) -> &ExecutionContext {
        match self {
            Self::DoRun { ctx }
            | Self::DoPhase { ctx }
            | Self::DoStep { ctx }
            | Self::DoStepEnd { ctx }
            | Self::OnPhaseEnd { ctx }
            | Self::OnRunEnd { ctx }
            | Self::DoStepError { ctx, .. }
            | Self::OnPhaseError { ctx, .. }
            | Self::OnRunError { ctx, .. }
            | Self::DoSubOperation { ctx, .. }
            | Self::Correlate { ctx, .. } => ctx,
        }
    }

    /// Queue the message is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::DoSubOperation { .. } => GENERATORS_QUEUE,
            Self::Correlate { .. } => CORRELATOR_QUEUE,
            _ => ORCHESTRATION_QUEUE,
        }
    }

    /// Transition label naming the target, e.g. `do_step(1,2)`.
    pub fn label(&self) -> String {
        match self {
            Self::DoRun { .. } => "do_run".to_owned(),
            Self::DoPhase { ctx } => format!("do_phase({})", ctx.phase_index + 1),
            Self::DoStep { ctx } => format!("do_step({},{})", ctx.phase_index, ctx.step_index + 1),
            Self::DoStepEnd { ctx } => format!("do_step_end({},{})", ctx.phase_index, ctx.step_index),
            Self::OnPhaseEnd { ctx } => format!("on_phase_end({})", ctx.phase_index),
            Self::OnRunEnd { .. } => "on_run_end".to_owned(),
            Self::DoStepError { ctx, .. } => {
                format!("do_step_error({},{})", ctx.phase_index, ctx.step_index)
            }
            Self::OnPhaseError { ctx, .. } => format!("on_phase_error({})", ctx.phase_index),
            Self::OnRunError { .. } => "on_run_error".to_owned(),
            Self::DoSubOperation { ctx, member, .. } => format!(
                "do_sub_operation({},{})#{member}",
                ctx.phase_index, ctx.step_index
            ),
            Self::Correlate { event, .. } => format!("correlate({})", event.deploy_hash),
        }
    }

    /// Transition following a completed step.
    pub fn after_step(ctx: ExecutionContext, is_last_in_phase: bool) -> Self {
        if is_last_in_phase {
            Self::OnPhaseEnd { ctx }
        } else {
            Self::DoStep { ctx }
        }
    }
}
