//! Generic steps usable by any workload definition.
//!
//! Generator specific steps (transfers, auction bids, …) live with the
//! generators; these cover the bookkeeping shapes shared by all of them.

use async_trait::async_trait;
use tracing::info;

use crate::verification::{verify_block_hash, verify_deploy_count, verify_deploy_hash};
use crate::{
    DeployFinalized, EventVerifier, ExecutionContext, Step, StepError, StepOutcome,
    VerificationError,
};

// ---------------------------------------------------------------------------
// LoggingStep
// ---------------------------------------------------------------------------

/// Synchronous step that only reports its own execution.
pub struct LoggingStep {
    label: String,
    description: String,
}

impl LoggingStep {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self { label: label.into(), description: description.into() }
    }
}

#[async_trait]
impl Step for LoggingStep {
    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome, StepError> {
        info!(
            run_type = %ctx.run_type,
            run = %ctx.run_index_label(),
            phase = %ctx.phase_index_label(),
            step = %ctx.step_index_label(),
            "{}: {}",
            self.label,
            self.description
        );
        Ok(StepOutcome::Done)
    }
}

// ---------------------------------------------------------------------------
// AwaitDeploysStep
// ---------------------------------------------------------------------------

/// Asynchronous step completing once a number of deploys have finalized.
///
/// The expected count is read from the run arguments under `count_arg`.
/// Deploy dispatch itself is performed by an upstream generator.
pub struct AwaitDeploysStep {
    label: String,
    count_arg: String,
}

impl AwaitDeploysStep {
    pub fn new(label: impl Into<String>, count_arg: impl Into<String>) -> Self {
        Self { label: label.into(), count_arg: count_arg.into() }
    }

    fn expected(&self, ctx: &ExecutionContext) -> Result<u64, StepError> {
        ctx.arg_u64(&self.count_arg).ok_or_else(|| {
            StepError::Execution(format!("missing numeric run argument '{}'", self.count_arg))
        })
    }
}

#[async_trait]
impl Step for AwaitDeploysStep {
    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome, StepError> {
        let expected = self.expected(ctx)?;
        info!(
            run = %ctx.run_index_label(),
            step = %self.label,
            expected,
            "awaiting finalized deploys"
        );
        Ok(StepOutcome::Done)
    }

    fn event_verifier(&self) -> Option<&dyn EventVerifier> {
        Some(self)
    }
}

#[async_trait]
impl EventVerifier for AwaitDeploysStep {
    async fn verify_on_event(
        &self,
        ctx: &ExecutionContext,
        event: &DeployFinalized,
        deploy_count: u64,
    ) -> Result<(), VerificationError> {
        verify_deploy_hash(event)?;
        verify_block_hash(event)?;
        let expected = self
            .expected(ctx)
            .map_err(|e| VerificationError::fatal(e.to_string()))?;
        verify_deploy_count(deploy_count, expected)
    }
}
