//! Resumes asynchronous steps from finalized deploy events.
//!
//! An asynchronous step parks after executing.  Each deploy-finalized event
//! for its run is counted against the step and offered to the step's event
//! verifier; once the verifier accepts, the step is completed and the next
//! pipeline entry is dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use queue::MessageQueue;
use steps::{DeployFinalized, ExecutionContext, ExecutionStatus, Step};
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::lock::{DistributedLock, Lock};
use crate::messages::OrchestrationMessage;
use crate::models::ExecutionAspect;
use crate::state::ExecutionStateStore;
use crate::workflow::WorkflowRegistry;
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepAddress {
    pub phase: u32,
    pub step: u32,
}

/// Step addresses of one workflow in execution order, with the
/// asynchronous steps indexed by address.
struct PipelineTable {
    entries: Vec<StepAddress>,
    verifiers: HashMap<StepAddress, Arc<dyn Step>>,
}

impl PipelineTable {
    fn next_after(&self, address: StepAddress) -> Option<StepAddress> {
        let position = self.entries.iter().position(|a| *a == address)?;
        self.entries.get(position + 1).copied()
    }
}

/// What an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Nothing to correlate against; no state touched.
    Ignored(&'static str),
    /// Counted, but the step is still waiting for more deploys.
    Pending { deploy_count: u64 },
    /// Step completed; `next` names the transition dispatched.
    Completed { next: String },
    /// Verification failed fatally; the error cascade was started.
    Failed,
}

pub struct Correlator {
    tables: HashMap<String, PipelineTable>,
    state: ExecutionStateStore,
    locks: DistributedLock,
    queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
    span: Span,
}

impl Correlator {
    pub fn new(
        registry: &WorkflowRegistry,
        state: ExecutionStateStore,
        locks: DistributedLock,
        queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
        span: Span,
    ) -> Self {
        let tables = registry
            .iter()
            .map(|workflow| {
                let mut table = PipelineTable { entries: Vec::new(), verifiers: HashMap::new() };
                for view in workflow.addresses() {
                    let address = StepAddress { phase: view.phase_index, step: view.index };
                    table.entries.push(address);
                    if view.step.is_async() {
                        table.verifiers.insert(address, Arc::clone(view.step));
                    }
                }
                (workflow.run_type().to_owned(), table)
            })
            .collect();

        Self { tables, state, locks, queue, span }
    }

    /// Correlate `event` with the step of `ctx`'s run that is waiting on it.
    ///
    /// `ctx` may carry the step address; when it does not, the run's
    /// furthest step still in progress is used.
    pub async fn on_deploy_finalized(
        &self,
        ctx: &ExecutionContext,
        event: &DeployFinalized,
    ) -> Result<Correlation, EngineError> {
        let span = info_span!(
            parent: &self.span,
            "correlate",
            run_type = %ctx.run_type,
            run = %ctx.run_index_label(),
            deploy = %event.deploy_hash,
        );
        self.correlate(ctx, event).instrument(span).await
    }

    async fn correlate(
        &self,
        ctx: &ExecutionContext,
        event: &DeployFinalized,
    ) -> Result<Correlation, EngineError> {
        let Some(table) = self.tables.get(&ctx.run_type) else {
            return Ok(ignored("no pipeline table for run type"));
        };
        let Some(stored) = self.state.get_context(ctx).await? else {
            return Ok(ignored("run not found"));
        };
        if stored.status == ExecutionStatus::Error {
            return Ok(ignored("run halted"));
        }

        let address = if ctx.phase_index > 0 && ctx.step_index > 0 {
            StepAddress { phase: ctx.phase_index, step: ctx.step_index }
        } else {
            match self.state.get_pending_step(ctx).await? {
                Some(info) => StepAddress {
                    phase: info.phase_index.unwrap_or(0),
                    step: info.step_index.unwrap_or(0),
                },
                None => return Ok(ignored("step not in progress")),
            }
        };
        let Some(step) = table.verifiers.get(&address) else {
            return Ok(ignored("step does not verify deploy events"));
        };
        let Some(verifier) = step.event_verifier() else {
            return Ok(ignored("step does not verify deploy events"));
        };
        let label = step.label().to_owned();

        let mut target = stored;
        target.phase_index = address.phase;
        target.step_index = address.step;

        match self.state.get_info(&target, ExecutionAspect::Step).await? {
            Some(info) if info.status == ExecutionStatus::InProgress => {}
            _ => return Ok(ignored("step not in progress")),
        }

        // A lost claim is a duplicate event or a redelivery: the count is
        // unchanged and the step is evaluated again.
        let deploy_lock = Lock::Deploy { deploy_hash: event.deploy_hash.clone() };
        let (_, first_seen) = self.locks.acquire(&deploy_lock, &target).await?;
        if !first_seen {
            debug!(step = %label, "deploy already counted");
        }
        let deploy_count = self.state.get_deploy_count(&target).await?;

        match verifier.verify_on_event(&target, event, deploy_count).await {
            Err(source) if source.is_ignorable() => {
                info!(step = %label, deploy_count, reason = %source, "awaiting further deploys");
                Ok(Correlation::Pending { deploy_count })
            }
            Err(source) => {
                let err = EngineError::Verification { label, source };
                error!(error = %err, "deploy verification failed");
                self.dispatch(OrchestrationMessage::DoStepError { ctx: target, error: err.to_string() })
                    .await?;
                Ok(Correlation::Failed)
            }
            Ok(()) => {
                let next = match table.next_after(address) {
                    Some(next) if next.phase == address.phase => {
                        OrchestrationMessage::DoStep { ctx: target.clone() }
                    }
                    _ => OrchestrationMessage::OnPhaseEnd { ctx: target.clone() },
                };
                let next_label = next.label();

                // The step stays IN_PROGRESS until its successor is queued.
                self.dispatch(next).await?;
                self.state
                    .update_info(&target, ExecutionAspect::Step, ExecutionStatus::Complete, None)
                    .await?;
                info!(step = %label, deploy_count, next = %next_label, "step verified");
                Ok(Correlation::Completed { next: next_label })
            }
        }
    }

    async fn dispatch(&self, message: OrchestrationMessage) -> Result<(), EngineError> {
        self.queue.send(message.queue(), message).await?;
        Ok(())
    }
}

fn ignored(reason: &'static str) -> Correlation {
    info!(reason, "deploy event ignored");
    Correlation::Ignored(reason)
}
