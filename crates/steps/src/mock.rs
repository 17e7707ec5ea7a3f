//! `MockStep` — a test double for `Step`.
//!
//! Useful in unit and integration tests where a real generator step is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

use crate::verification::{verify_block_hash, verify_deploy_count};
use crate::{
    DeployFinalized, EventVerifier, ExecutionContext, Step, StepError, StepOutcome, SubOperation,
    VerificationError, Verifier,
};

/// Behaviour injected into `MockStep` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Finish immediately.
    Done,
    /// Return a batch of `n` sub-operations of kind `mock`.
    Batch(usize),
    /// Fail with a `StepError::Execution`.
    Fail(String),
}

/// A mock step that records every call it receives and returns a
/// programmer-specified result.
pub struct MockStep {
    /// Label used in test assertions.
    pub label: String,
    /// What the step will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All contexts seen by `execute` (in call order).
    pub calls: Arc<Mutex<Vec<ExecutionContext>>>,
    /// All sub-operations executed on behalf of this step.
    pub sub_calls: Arc<Mutex<Vec<SubOperation>>>,
    /// Set for asynchronous steps: deploys expected before completion.
    expected_deploys: Option<u64>,
    /// Outcome of the post-execution verifier, when one is declared.
    verification: Option<Result<(), VerificationError>>,
    /// Sub-operations fail with this message when set.
    sub_operation_failure: Option<String>,
}

impl MockStep {
    fn with_behaviour(label: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            label: label.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            sub_calls: Arc::new(Mutex::new(Vec::new())),
            expected_deploys: None,
            verification: None,
            sub_operation_failure: None,
        }
    }

    /// Create a mock that always finishes inline.
    pub fn done(label: impl Into<String>) -> Self {
        Self::with_behaviour(label, MockBehaviour::Done)
    }

    /// Create a mock that returns a batch of `n` sub-operations.
    pub fn batch(label: impl Into<String>, n: usize) -> Self {
        Self::with_behaviour(label, MockBehaviour::Batch(n))
    }

    /// Create a mock whose `execute` always fails.
    pub fn failing(label: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(label, MockBehaviour::Fail(msg.into()))
    }

    /// Make the step asynchronous: it completes once `n` deploys are correlated.
    pub fn awaiting_deploys(mut self, n: u64) -> Self {
        self.expected_deploys = Some(n);
        self
    }

    /// Declare a post-execution verifier that yields `result`.
    pub fn verified_with(mut self, result: Result<(), VerificationError>) -> Self {
        self.verification = Some(result);
        self
    }

    /// Make every sub-operation fail.
    pub fn failing_sub_operations(mut self, msg: impl Into<String>) -> Self {
        self.sub_operation_failure = Some(msg.into());
        self
    }

    /// Number of times this step has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of sub-operations executed on behalf of this step.
    pub fn sub_operation_count(&self) -> usize {
        self.sub_calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Step for MockStep {
    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StepOutcome, StepError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(ctx.clone());

        match &self.behaviour {
            MockBehaviour::Done => Ok(StepOutcome::Done),
            MockBehaviour::Batch(n) => Ok(StepOutcome::batch(
                (0..*n)
                    .map(|i| SubOperation::new("mock", json!({ "index": i })))
                    .collect(),
            )),
            MockBehaviour::Fail(msg) => Err(StepError::Execution(msg.clone())),
        }
    }

    async fn execute_sub_operation(
        &self,
        _ctx: &ExecutionContext,
        op: &SubOperation,
    ) -> Result<(), StepError> {
        self.sub_calls.lock().unwrap_or_else(PoisonError::into_inner).push(op.clone());

        match &self.sub_operation_failure {
            Some(msg) => Err(StepError::Execution(msg.clone())),
            None => Ok(()),
        }
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        self.verification.as_ref().map(|_| self as &dyn Verifier)
    }

    fn event_verifier(&self) -> Option<&dyn EventVerifier> {
        self.expected_deploys.map(|_| self as &dyn EventVerifier)
    }
}

#[async_trait]
impl Verifier for MockStep {
    async fn verify(&self, _ctx: &ExecutionContext) -> Result<(), VerificationError> {
        self.verification.clone().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl EventVerifier for MockStep {
    async fn verify_on_event(
        &self,
        _ctx: &ExecutionContext,
        event: &DeployFinalized,
        deploy_count: u64,
    ) -> Result<(), VerificationError> {
        verify_block_hash(event)?;
        verify_deploy_count(deploy_count, self.expected_deploys.unwrap_or(0))
    }
}
