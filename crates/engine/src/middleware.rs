//! Layers wrapped around step execution.
//!
//! `do_step` runs the step through an ordered chain; each layer gets the
//! target context and a [`Next`] handle to the rest of the chain.  The
//! default chain is: step lock, then state recording, then timing, then
//! the step itself.

use std::sync::Arc;

use async_trait::async_trait;
use steps::{ExecutionContext, Step, StepOutcome};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::lock::{DistributedLock, Lock};
use crate::models::ExecutionInfo;
use crate::state::ExecutionStateStore;
use crate::EngineError;

#[async_trait]
pub trait StepMiddleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, EngineError>;
}

/// The remainder of the chain, ending in the step.
pub struct Next<'a> {
    step: &'a dyn Step,
    middleware: &'a [Arc<dyn StepMiddleware>],
}

impl<'a> Next<'a> {
    pub fn new(step: &'a dyn Step, middleware: &'a [Arc<dyn StepMiddleware>]) -> Self {
        Self { step, middleware }
    }

    pub fn step(&self) -> &'a dyn Step {
        self.step
    }

    pub async fn run(mut self, ctx: &ExecutionContext) -> Result<StepOutcome, EngineError> {
        if let Some((current, rest)) = self.middleware.split_first() {
            self.middleware = rest;
            current.handle(ctx, self).await
        } else {
            self.step
                .execute(ctx)
                .await
                .map_err(|source| EngineError::StepExecution {
                    label: self.step.label().to_owned(),
                    source,
                })
        }
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Claims the step lock; a lost race stops the chain.
pub struct StepLockLayer {
    locks: DistributedLock,
}

impl StepLockLayer {
    pub fn new(locks: DistributedLock) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl StepMiddleware for StepLockLayer {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, EngineError> {
        self.locks.claim(&Lock::Step, ctx).await?;
        next.run(ctx).await
    }
}

/// Persists the advanced context and an IN_PROGRESS step record.
pub struct StateRecorderLayer {
    state: ExecutionStateStore,
}

impl StateRecorderLayer {
    pub fn new(state: ExecutionStateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StepMiddleware for StateRecorderLayer {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, EngineError> {
        self.state.set_context(ctx).await?;
        self.state
            .start_info(ctx, &ExecutionInfo::for_step(ctx, next.step().label()))
            .await?;
        next.run(ctx).await
    }
}

/// Logs step start and elapsed execution time.
pub struct TimingLayer;

#[async_trait]
impl StepMiddleware for TimingLayer {
    async fn handle(
        &self,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, EngineError> {
        let label = next.step().label().to_owned();
        debug!(step = %label, "step executing");
        let started = Instant::now();
        let result = next.run(ctx).await;
        info!(
            step = %label,
            phase = %ctx.phase_index_label(),
            index = %ctx.step_index_label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "step executed"
        );
        result
    }
}
