//! The `Step` trait — the contract every workflow step must fulfil.

use async_trait::async_trait;

use crate::{DeployFinalized, ExecutionContext, StepError, StepOutcome, SubOperation, VerificationError};

/// The core step trait.
///
/// Only `label` and `execute` are mandatory.  The optional capabilities are
/// exposed as accessors so the engine can tell whether a step has them
/// without calling into it.
#[async_trait]
pub trait Step: Send + Sync {
    /// Human readable label, e.g. `fund-users`.
    fn label(&self) -> &str;

    /// Execute the step for the given context.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome, StepError>;

    /// Execute one sub-operation previously returned in a [`crate::Batch`].
    async fn execute_sub_operation(
        &self,
        _ctx: &ExecutionContext,
        op: &SubOperation,
    ) -> Result<(), StepError> {
        Err(StepError::UnsupportedSubOperation {
            label: self.label().to_owned(),
            kind: op.kind.clone(),
        })
    }

    /// Post-execution verifier, if the step declares one.
    fn verifier(&self) -> Option<&dyn Verifier> {
        None
    }

    /// Deploy event verifier, if the step declares one.
    fn event_verifier(&self) -> Option<&dyn EventVerifier> {
        None
    }

    /// Asynchronous steps complete only once matching chain events arrive.
    fn is_async(&self) -> bool {
        self.event_verifier().is_some()
    }
}

/// Verifies a step once it has finished executing.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, ctx: &ExecutionContext) -> Result<(), VerificationError>;
}

/// Verifies a finalized deploy against the step waiting for it.
///
/// `deploy_count` is the number of deploys correlated to the step so far,
/// including this one.
#[async_trait]
pub trait EventVerifier: Send + Sync {
    async fn verify_on_event(
        &self,
        ctx: &ExecutionContext,
        event: &DeployFinalized,
        deploy_count: u64,
    ) -> Result<(), VerificationError>;
}
