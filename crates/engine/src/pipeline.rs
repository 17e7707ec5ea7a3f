//! Orchestration pipeline.
//!
//! `Orchestrator` advances runs one transition per message:
//!
//! `do_run → do_phase → do_step → do_step_end → (do_step | on_phase_end)
//!  → (do_phase | on_run_end)`
//!
//! Every handler re-derives its target from the incoming context, then
//! checks bounds, the persisted position and the transition lock before
//! mutating anything.  A failed check drops the message, so duplicated or
//! reordered deliveries are harmless.  Step failures cascade through
//! `do_step_error → on_phase_error → on_run_error` and halt the run.

use std::sync::Arc;
use std::time::Duration;

use queue::{MessageQueue, TaskSet};
use rand::Rng;
use steps::{Batch, ExecutionContext, ExecutionStatus, StepOutcome, SubOperation};
use store::KvStore;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::EngineConfig;
use crate::correlator::{Correlation, Correlator};
use crate::keys;
use crate::lock::{DistributedLock, Lock};
use crate::messages::OrchestrationMessage;
use crate::middleware::{Next, StateRecorderLayer, StepLockLayer, StepMiddleware, TimingLayer};
use crate::models::{ExecutionAspect, ExecutionInfo};
use crate::state::ExecutionStateStore;
use crate::workflow::{StepView, WorkflowDefinition, WorkflowRegistry};
use crate::EngineError;

/// What happened to a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied(String),
    Dropped { label: String, reason: String },
}

impl Disposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    state: ExecutionStateStore,
    locks: DistributedLock,
    queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
    barriers: TaskSet<OrchestrationMessage>,
    middleware: Vec<Arc<dyn StepMiddleware>>,
    correlator: Correlator,
    config: EngineConfig,
    span: Span,
}

impl Orchestrator {
    /// `span` parents every per-message span the orchestrator emits.
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<dyn KvStore>,
        queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
        config: EngineConfig,
        span: Span,
    ) -> Self {
        let state = ExecutionStateStore::new(Arc::clone(&store));
        let locks = DistributedLock::new(Arc::clone(&store), config.worker_id.as_str());
        let middleware: Vec<Arc<dyn StepMiddleware>> = vec![
            Arc::new(StepLockLayer::new(locks.clone())),
            Arc::new(StateRecorderLayer::new(state.clone())),
            Arc::new(TimingLayer),
        ];
        let correlator = Correlator::new(
            &registry,
            state.clone(),
            locks.clone(),
            Arc::clone(&queue),
            span.clone(),
        );

        Self {
            registry,
            state,
            locks,
            queue,
            barriers: TaskSet::new(store),
            middleware,
            correlator,
            config,
            span,
        }
    }

    /// Append a layer, run after the built-in ones and just before the step.
    pub fn with_middleware(mut self, layer: Arc<dyn StepMiddleware>) -> Self {
        self.middleware.push(layer);
        self
    }

    pub fn state(&self) -> &ExecutionStateStore {
        &self.state
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Start (or restart) a run: clear its locks, then enqueue `do_run`.
    pub async fn submit(&self, mut ctx: ExecutionContext) -> Result<(), EngineError> {
        ctx.phase_index = 0;
        ctx.step_index = 0;
        ctx.status = ExecutionStatus::Pending;

        let cleared = self.state.flush_locks(&ctx).await?;
        info!(
            parent: &self.span,
            network = %ctx.network,
            run_type = %ctx.run_type,
            run = %ctx.run_index_label(),
            cleared,
            "run submitted"
        );
        self.dispatch(OrchestrationMessage::DoRun { ctx }).await
    }

    /// Handle one delivered message.
    ///
    /// Drops are reported as [`Disposition::Dropped`]; an `Err` means the
    /// delivery should be retried.
    pub async fn handle(&self, message: OrchestrationMessage) -> Result<Disposition, EngineError> {
        let label = message.label();
        let ctx = message.ctx();
        let span = info_span!(
            parent: &self.span,
            "transition",
            message = %label,
            network = %ctx.network,
            run_type = %ctx.run_type,
            run = %ctx.run_index_label(),
        );

        let result = self.route(message).instrument(span.clone()).await;
        match result {
            Ok(None) => Ok(Disposition::Applied(label)),
            Ok(Some(reason)) => Ok(Disposition::Dropped { label, reason }),
            Err(err) if err.is_drop() => {
                span.in_scope(|| warn!(reason = %err, "transition dropped"));
                Ok(Disposition::Dropped { label, reason: err.to_string() })
            }
            Err(err) => {
                span.in_scope(|| error!(error = %err, "transition failed"));
                Err(err)
            }
        }
    }

    /// `Ok(Some(reason))` when the message was accepted but had no effect.
    async fn route(&self, message: OrchestrationMessage) -> Result<Option<String>, EngineError> {
        use OrchestrationMessage::*;

        let applied = match message {
            DoRun { ctx } => self.do_run(ctx).await,
            DoPhase { ctx } => self.do_phase(ctx).await,
            DoStep { ctx } => self.do_step(ctx).await,
            DoStepEnd { ctx } => self.do_step_end(ctx).await,
            OnPhaseEnd { ctx } => self.on_phase_end(ctx).await,
            OnRunEnd { ctx } => self.on_run_end(ctx).await,
            DoStepError { ctx, error } => self.do_step_error(ctx, error).await,
            OnPhaseError { ctx, error } => self.on_phase_error(ctx, error).await,
            OnRunError { ctx, error } => self.on_run_error(ctx, error).await,
            DoSubOperation { ctx, member, op, barrier } => {
                self.do_sub_operation(ctx, member, op, barrier).await
            }
            Correlate { ctx, event } => {
                return match self.correlator.on_deploy_finalized(&ctx, &event).await? {
                    Correlation::Ignored(reason) => Ok(Some(reason.to_owned())),
                    _ => Ok(None),
                };
            }
        };
        applied.map(|()| None)
    }

    // -----------------------------------------------------------------------
    // Forward transitions
    // -----------------------------------------------------------------------

    async fn do_run(&self, mut ctx: ExecutionContext) -> Result<(), EngineError> {
        ctx.phase_index = 0;
        ctx.step_index = 0;
        self.resolve(&ctx)?;
        self.locks.claim(&Lock::Run, &ctx).await?;

        self.state.flush_by_run(&ctx).await?;
        ctx.status = ExecutionStatus::InProgress;
        self.state.set_context(&ctx).await?;
        self.state.start_info(&ctx, &ExecutionInfo::for_run(&ctx)).await?;
        info!("run started");

        self.dispatch(OrchestrationMessage::DoPhase { ctx }).await
    }

    async fn do_phase(&self, mut ctx: ExecutionContext) -> Result<(), EngineError> {
        let workflow = self.resolve(&ctx)?;
        ctx.phase_index += 1;
        ctx.step_index = 0;
        let phase = workflow.get_phase(ctx.phase_index)?;

        self.ensure_advances(&ctx, ExecutionAspect::Phase).await?;
        self.locks.claim(&Lock::Phase, &ctx).await?;

        self.state.set_context(&ctx).await?;
        self.state.start_info(&ctx, &ExecutionInfo::for_phase(&ctx)).await?;
        info!(phase = phase.index, steps = phase.step_count(), "phase started");

        self.dispatch(OrchestrationMessage::DoStep { ctx }).await
    }

    async fn do_step(&self, mut ctx: ExecutionContext) -> Result<(), EngineError> {
        let workflow = self.resolve(&ctx)?;
        ctx.step_index += 1;
        let step = workflow.get_step(ctx.phase_index, ctx.step_index)?;

        self.ensure_advances(&ctx, ExecutionAspect::Step).await?;

        match Next::new(step.step.as_ref(), &self.middleware).run(&ctx).await {
            Ok(outcome) => self.on_outcome(ctx, &step, outcome).await,
            Err(err @ EngineError::StepExecution { .. }) => {
                error!(error = %err, "step failed");
                self.dispatch(OrchestrationMessage::DoStepError { ctx, error: err.to_string() })
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn on_outcome(
        &self,
        ctx: ExecutionContext,
        step: &StepView<'_>,
        outcome: StepOutcome,
    ) -> Result<(), EngineError> {
        let is_async = step.step.is_async();
        match outcome {
            StepOutcome::Done if is_async => {
                info!(step = %step.label(), "step parked awaiting deploy events");
                Ok(())
            }
            StepOutcome::Batch(batch) if is_async => {
                info!(step = %step.label(), operations = batch.len(), "step parked awaiting deploy events");
                self.dispatch_batch(&ctx, batch, None).await
            }
            StepOutcome::Done => self.dispatch(OrchestrationMessage::DoStepEnd { ctx }).await,
            StepOutcome::Batch(batch) if batch.is_empty() => {
                self.dispatch(OrchestrationMessage::DoStepEnd { ctx }).await
            }
            StepOutcome::Batch(batch) => {
                let barrier = keys::aspect(keys::BARRIER, &ctx, ExecutionAspect::Step).key();
                let on_failure = OrchestrationMessage::DoStepError {
                    ctx: ctx.clone(),
                    error: format!("sub-operation of step '{}' failed", step.label()),
                };
                self.barriers
                    .open(
                        &barrier,
                        batch.len() as u64,
                        OrchestrationMessage::DoStepEnd { ctx: ctx.clone() },
                        Some(on_failure),
                    )
                    .await?;
                self.dispatch_batch(&ctx, batch, Some(barrier)).await
            }
        }
    }

    async fn do_step_end(&self, ctx: ExecutionContext) -> Result<(), EngineError> {
        self.ensure_not_halted(&ctx).await?;
        let workflow = self.resolve(&ctx)?;
        let step = workflow.get_step(ctx.phase_index, ctx.step_index)?;

        match self.state.get_info(&ctx, ExecutionAspect::Step).await? {
            Some(info) if info.status == ExecutionStatus::InProgress => {}
            other => {
                let persisted = other.map_or("none".to_owned(), |i| i.status.to_string());
                return Err(stale(&ctx, persisted));
            }
        }

        if let Some(verifier) = step.step.verifier() {
            if let Err(source) = verifier.verify(&ctx).await {
                let err = EngineError::Verification { label: step.label().to_owned(), source };
                if err.is_drop() {
                    warn!(error = %err, "ignorable verification failure");
                } else {
                    error!(error = %err, "step verification failed");
                    return self
                        .dispatch(OrchestrationMessage::DoStepError { ctx, error: err.to_string() })
                        .await;
                }
            }
        }

        self.dispatch(OrchestrationMessage::after_step(ctx.clone(), step.is_last)).await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Step, ExecutionStatus::Complete, None)
            .await?;
        debug!(step = %step.label(), "step complete");
        Ok(())
    }

    async fn on_phase_end(&self, ctx: ExecutionContext) -> Result<(), EngineError> {
        self.ensure_not_halted(&ctx).await?;
        let workflow = self.resolve(&ctx)?;
        let phase = workflow.get_phase(ctx.phase_index)?;
        self.ensure_open(&ctx, ExecutionAspect::Phase).await?;

        let next = if phase.is_last {
            OrchestrationMessage::OnRunEnd { ctx: ctx.clone() }
        } else {
            OrchestrationMessage::DoPhase { ctx: ctx.clone() }
        };
        self.dispatch(next).await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Phase, ExecutionStatus::Complete, None)
            .await?;
        info!(phase = phase.index, "phase complete");
        Ok(())
    }

    async fn on_run_end(&self, mut ctx: ExecutionContext) -> Result<(), EngineError> {
        self.ensure_not_halted(&ctx).await?;
        self.ensure_open(&ctx, ExecutionAspect::Run).await?;

        ctx.status = ExecutionStatus::Complete;
        self.state.set_context(&ctx).await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Run, ExecutionStatus::Complete, None)
            .await?;
        info!("run complete");
        Ok(())
    }

    async fn do_sub_operation(
        &self,
        ctx: ExecutionContext,
        member: u64,
        op: SubOperation,
        barrier: Option<String>,
    ) -> Result<(), EngineError> {
        self.ensure_not_halted(&ctx).await?;
        let workflow = self.resolve(&ctx)?;
        let step = workflow.get_step(ctx.phase_index, ctx.step_index)?;

        let result = step.step.execute_sub_operation(&ctx, &op).await;
        let continuation = match (result, barrier) {
            (Ok(()), Some(id)) => self.barriers.record_success(&id, member).await?,
            (Ok(()), None) => None,
            (Err(source), Some(id)) => {
                warn!(member, kind = %op.kind, error = %source, "sub-operation failed");
                self.barriers.record_failure(&id, member).await?
            }
            (Err(source), None) => {
                let err = EngineError::StepExecution { label: step.label().to_owned(), source };
                error!(member, kind = %op.kind, error = %err, "sub-operation failed");
                Some(OrchestrationMessage::DoStepError { ctx, error: err.to_string() })
            }
        };

        if let Some(next) = continuation {
            self.dispatch(next).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Error cascade
    // -----------------------------------------------------------------------

    async fn do_step_error(&self, ctx: ExecutionContext, error: String) -> Result<(), EngineError> {
        self.ensure_open(&ctx, ExecutionAspect::Step).await?;
        self.dispatch(OrchestrationMessage::OnPhaseError { ctx: ctx.clone(), error: error.clone() })
            .await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Step, ExecutionStatus::Error, Some(error))
            .await?;
        Ok(())
    }

    async fn on_phase_error(&self, ctx: ExecutionContext, error: String) -> Result<(), EngineError> {
        self.ensure_open(&ctx, ExecutionAspect::Phase).await?;
        self.dispatch(OrchestrationMessage::OnRunError { ctx: ctx.clone(), error: error.clone() })
            .await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Phase, ExecutionStatus::Error, Some(error))
            .await?;
        Ok(())
    }

    async fn on_run_error(&self, ctx: ExecutionContext, error: String) -> Result<(), EngineError> {
        self.ensure_open(&ctx, ExecutionAspect::Run).await?;
        let mut halted = self.state.get_context(&ctx).await?.unwrap_or_else(|| ctx.clone());
        halted.status = ExecutionStatus::Error;
        self.state.set_context(&halted).await?;
        self.state
            .update_info(&ctx, ExecutionAspect::Run, ExecutionStatus::Error, Some(error.clone()))
            .await?;
        error!(%error, "run halted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Resolve and re-validate the run's workflow.
    fn resolve(&self, ctx: &ExecutionContext) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let workflow = self.registry.resolve(&ctx.run_type)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// The target must be exactly one past the persisted position.
    async fn ensure_advances(
        &self,
        target: &ExecutionContext,
        aspect: ExecutionAspect,
    ) -> Result<(), EngineError> {
        let Some(persisted) = self.state.get_context(target).await? else {
            return Err(stale(target, "none"));
        };
        if persisted.status == ExecutionStatus::Error {
            return Err(EngineError::RunHalted { run: address(target) });
        }

        let advances = match aspect {
            ExecutionAspect::Run => true,
            ExecutionAspect::Phase => persisted.phase_index + 1 == target.phase_index,
            ExecutionAspect::Step => {
                persisted.phase_index == target.phase_index
                    && persisted.step_index + 1 == target.step_index
            }
        };
        if advances {
            Ok(())
        } else {
            Err(stale(target, address(&persisted)))
        }
    }

    /// The aspect's record is not yet COMPLETE or ERROR.  End and error
    /// handlers queue their successor before recording the terminal status.
    async fn ensure_open(
        &self,
        ctx: &ExecutionContext,
        aspect: ExecutionAspect,
    ) -> Result<(), EngineError> {
        match self.state.get_info(ctx, aspect).await? {
            Some(info) if info.status.is_terminal() => {
                Err(stale(ctx, format!("{aspect} already finished")))
            }
            _ => Ok(()),
        }
    }

    async fn ensure_not_halted(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        match self.state.get_context(ctx).await? {
            Some(persisted) if persisted.status == ExecutionStatus::Error => {
                Err(EngineError::RunHalted { run: address(ctx) })
            }
            _ => Ok(()),
        }
    }

    async fn dispatch(&self, message: OrchestrationMessage) -> Result<(), EngineError> {
        debug!(next = %message.label(), "dispatching");
        self.queue.send(message.queue(), message).await?;
        Ok(())
    }

    async fn dispatch_batch(
        &self,
        ctx: &ExecutionContext,
        batch: Batch,
        barrier: Option<String>,
    ) -> Result<(), EngineError> {
        let window = batch.dispatch_window.unwrap_or(self.config.dispatch_window);
        for (member, op) in batch.operations.into_iter().enumerate() {
            let message = OrchestrationMessage::DoSubOperation {
                ctx: ctx.clone(),
                member: member as u64,
                op,
                barrier: barrier.clone(),
            };
            self.queue
                .send_with_delay(message.queue(), message, jitter(window))
                .await?;
        }
        Ok(())
    }
}

/// Uniform delay within `window`.
fn jitter(window: Duration) -> Duration {
    let max = window.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max))
}

fn address(ctx: &ExecutionContext) -> String {
    format!(
        "{}.{}.{}.{}",
        ctx.run_type,
        ctx.run_index_label(),
        ctx.phase_index_label(),
        ctx.step_index_label()
    )
}

fn stale(target: &ExecutionContext, persisted: impl Into<String>) -> EngineError {
    EngineError::StaleTransition { target: address(target), persisted: persisted.into() }
}
