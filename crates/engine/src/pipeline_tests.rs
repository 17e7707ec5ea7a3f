//! Scenario tests for the orchestration pipeline.
//!
//! Every test runs against `FlakyStore` (a `MemoryStore` with injectable
//! faults) and `MemoryQueue`, driving the worker one message at a time so
//! the transition sequence is observable.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use queue::{MemoryQueue, MessageQueue};
use serde_json::json;
use steps::mock::MockStep;
use steps::{DeployFinalized, ExecutionContext, ExecutionStatus, Step, VerificationError};
use store::mock::{FlakyStore, StoreOp};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::messages::{OrchestrationMessage, ORCHESTRATION_QUEUE, QUEUES};
use crate::{
    Correlation, Disposition, EngineConfig, ExecutionAspect, Orchestrator, Worker,
    WorkflowDefinition, WorkflowRegistry,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<FlakyStore>,
    queue: Arc<MemoryQueue<OrchestrationMessage>>,
    orchestrator: Arc<Orchestrator>,
    worker: Arc<Worker>,
}

impl Harness {
    fn new(registry: WorkflowRegistry) -> Self {
        let store = Arc::new(FlakyStore::new());
        let queue = Arc::new(MemoryQueue::<OrchestrationMessage>::default());
        let config = EngineConfig {
            worker_id: "test-worker".into(),
            poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(registry),
            store.clone(),
            queue.clone(),
            config.clone(),
            Span::none(),
        ));
        let worker = Arc::new(Worker::new(orchestrator.clone(), queue.clone(), config));
        Self { store, queue, orchestrator, worker }
    }

    fn with(workflow: WorkflowDefinition) -> Self {
        let mut registry = WorkflowRegistry::new();
        registry.register(workflow);
        Self::new(registry)
    }

    async fn run_to_idle(&self) -> Vec<Disposition> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = self.worker.tick().await.unwrap() {
            dispositions.push(disposition);
        }
        dispositions
    }

    /// Like `run_to_idle`, leaving failed deliveries for the queue to
    /// redeliver.  Returns the dispositions and the number of failures.
    async fn run_with_redelivery(&self) -> (Vec<Disposition>, usize) {
        let mut dispositions = Vec::new();
        let mut failures = 0;
        loop {
            match self.worker.tick().await {
                Ok(Some(disposition)) => dispositions.push(disposition),
                Ok(None) => break,
                Err(_) => failures += 1,
            }
        }
        (dispositions, failures)
    }

    async fn status(&self, ctx: &ExecutionContext, aspect: ExecutionAspect) -> Option<ExecutionStatus> {
        self.orchestrator
            .state()
            .get_info(ctx, aspect)
            .await
            .unwrap()
            .map(|info| info.status)
    }

    async fn stored(&self, ctx: &ExecutionContext) -> ExecutionContext {
        self.orchestrator.state().get_context(ctx).await.unwrap().unwrap()
    }
}

fn run_ctx(run_type: &str) -> ExecutionContext {
    ExecutionContext::new("LOC-01", run_type, 1, json!({ "user_accounts": 5 }))
}

fn at(ctx: &ExecutionContext, phase: u32, step: u32) -> ExecutionContext {
    let mut ctx = ctx.clone();
    ctx.phase_index = phase;
    ctx.step_index = step;
    ctx.status = ExecutionStatus::InProgress;
    ctx
}

fn mocks(labels: &[&str]) -> Vec<Arc<MockStep>> {
    labels.iter().map(|l| Arc::new(MockStep::done(*l))).collect()
}

fn as_steps(mocks: &[Arc<MockStep>]) -> Vec<Arc<dyn Step>> {
    mocks.iter().map(|m| m.clone() as Arc<dyn Step>).collect()
}

/// WG-100 with phases of [3, 1, 3] steps.
fn wg100(mocks: &[Arc<MockStep>]) -> WorkflowDefinition {
    WorkflowDefinition::builder("WG-100")
        .phase(as_steps(&mocks[0..3]))
        .phase(as_steps(&mocks[3..4]))
        .phase(as_steps(&mocks[4..7]))
        .build()
}

fn wg100_mocks() -> Vec<Arc<MockStep>> {
    mocks(&["a", "b", "c", "d", "e", "f", "g"])
}

/// Applied run/phase/step starts and the run end, in order.
fn transitions(dispositions: &[Disposition]) -> Vec<String> {
    dispositions
        .iter()
        .filter_map(|d| match d {
            Disposition::Applied(label)
                if label == "do_run"
                    || label == "on_run_end"
                    || label.starts_with("do_phase(")
                    || label.starts_with("do_step(") =>
            {
                Some(label.clone())
            }
            _ => None,
        })
        .collect()
}

fn applied(dispositions: &[Disposition], prefix: &str) -> usize {
    dispositions
        .iter()
        .filter(|d| matches!(d, Disposition::Applied(l) if l.starts_with(prefix)))
        .count()
}

// ============================================================
// Forward progression
// ============================================================

#[tokio::test]
async fn wg100_runs_every_step_once_in_order() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;

    assert_eq!(
        transitions(&dispositions),
        vec![
            "do_run",
            "do_phase(1)",
            "do_step(1,1)",
            "do_step(1,2)",
            "do_step(1,3)",
            "do_phase(2)",
            "do_step(2,1)",
            "do_phase(3)",
            "do_step(3,1)",
            "do_step(3,2)",
            "do_step(3,3)",
            "on_run_end",
        ]
    );
    assert!(dispositions.iter().all(Disposition::is_applied));

    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
    let stored = h.stored(&ctx).await;
    assert_eq!(stored.status, ExecutionStatus::Complete);
    assert_eq!((stored.phase_index, stored.step_index), (3, 3));

    for step in &steps {
        assert_eq!(step.call_count(), 1, "step {} ran more than once", step.label);
    }
    let infos = h.orchestrator.state().get_step_infos(&ctx).await.unwrap();
    assert_eq!(infos.len(), 7);
    assert!(infos.iter().all(|i| i.status == ExecutionStatus::Complete));
    assert!(infos.iter().all(|i| i.duration_ms.is_some()));
    assert_eq!(infos[3].step_label.as_deref(), Some("d"));
}

#[tokio::test]
async fn redelivered_step_after_completion_is_dropped() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    // do_step targeting (1, 2) again.
    h.queue
        .send(ORCHESTRATION_QUEUE, OrchestrationMessage::DoStep { ctx: at(&ctx, 1, 1) })
        .await
        .unwrap();
    let dispositions = h.run_to_idle().await;

    assert_eq!(dispositions.len(), 1);
    assert!(matches!(
        &dispositions[0],
        Disposition::Dropped { label, .. } if label == "do_step(1,2)"
    ));
    assert_eq!(steps[1].call_count(), 1);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn step_end_retried_after_store_failure_advances_once() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");

    // Writes to (1,2)'s record: PENDING, IN_PROGRESS, then COMPLETE fails.
    h.store.fail_once(StoreOp::Set, "info:LOC-01.WG-100.R-001.P-01.S-02", 2);
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let (dispositions, failures) = h.run_with_redelivery().await;

    assert_eq!(failures, 1);
    assert_eq!(h.store.armed(), 0);
    assert_eq!(applied(&dispositions, "do_step_end(1,2)"), 1);
    assert!(steps.iter().all(|s| s.call_count() == 1));
    let infos = h.orchestrator.state().get_step_infos(&ctx).await.unwrap();
    assert!(infos.iter().all(|i| i.status == ExecutionStatus::Complete));
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn duplicate_do_run_is_dropped_but_resubmission_restarts() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    h.queue
        .send(ORCHESTRATION_QUEUE, OrchestrationMessage::DoRun { ctx: ctx.clone() })
        .await
        .unwrap();
    let dispositions = h.run_to_idle().await;
    assert!(matches!(&dispositions[..], [Disposition::Dropped { .. }]));

    // Submission clears the run's locks and the run starts afresh.
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;
    assert_eq!(transitions(&dispositions).len(), 12);
    assert!(steps.iter().all(|s| s.call_count() == 2));
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn skip_ahead_and_out_of_range_targets_are_rejected() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();

    // do_run, do_phase(1); do_step(1,1) stays queued.
    h.worker.tick().await.unwrap();
    h.worker.tick().await.unwrap();
    let keys_before = h.store.memory().keys();

    let skip = h
        .orchestrator
        .handle(OrchestrationMessage::DoStep { ctx: at(&ctx, 1, 2) })
        .await
        .unwrap();
    assert!(matches!(skip, Disposition::Dropped { reason, .. } if reason.contains("stale")));

    let beyond_phase = h
        .orchestrator
        .handle(OrchestrationMessage::DoStep { ctx: at(&ctx, 2, 1) })
        .await
        .unwrap();
    assert!(matches!(beyond_phase, Disposition::Dropped { reason, .. } if reason.contains("out of bounds")));

    let beyond_run = h
        .orchestrator
        .handle(OrchestrationMessage::DoPhase { ctx: at(&ctx, 3, 3) })
        .await
        .unwrap();
    assert!(!beyond_run.is_applied());

    assert_eq!(h.store.memory().keys(), keys_before);
    assert_eq!(steps[2].call_count(), 0);
    let stored = h.stored(&ctx).await;
    assert_eq!((stored.phase_index, stored.step_index), (1, 0));

    // The queued do_step(1,1) still proceeds normally.
    h.run_to_idle().await;
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn unknown_or_invalid_workflows_never_start() {
    let mut registry = WorkflowRegistry::new();
    registry.register(
        WorkflowDefinition::builder("WG-000")
            .phase(as_steps(&mocks(&["a"])))
            .phase(Vec::new())
            .build(),
    );
    let h = Harness::new(registry);

    for run_type in ["WG-000", "WG-999"] {
        h.orchestrator.submit(run_ctx(run_type)).await.unwrap();
    }
    let dispositions = h.run_to_idle().await;

    assert_eq!(dispositions.len(), 2);
    assert!(dispositions.iter().all(|d| !d.is_applied()));
    assert!(h.store.memory().is_empty());
}

// ============================================================
// Batches
// ============================================================

#[tokio::test]
async fn sync_batch_completes_once_every_member_reports() {
    let fan = Arc::new(MockStep::batch("fan-out", 3));
    let tail = mocks(&["tail"]);
    let h = Harness::with(
        WorkflowDefinition::builder("WG-110")
            .phase([fan.clone() as Arc<dyn Step>])
            .phase(as_steps(&tail))
            .build(),
    );
    let ctx = run_ctx("WG-110");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;

    assert_eq!(fan.sub_operation_count(), 3);
    assert_eq!(applied(&dispositions, "do_sub_operation(1,1)"), 3);
    assert_eq!(applied(&dispositions, "do_step_end(1,1)"), 1);
    assert_eq!(tail[0].call_count(), 1);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn empty_batch_on_sync_step_completes_inline() {
    let empty = Arc::new(MockStep::batch("nothing-to-do", 0));
    let h = Harness::with(
        WorkflowDefinition::builder("WG-111")
            .phase([empty as Arc<dyn Step>])
            .build(),
    );
    let ctx = run_ctx("WG-111");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn failed_member_fails_the_step_once() {
    let fan = Arc::new(MockStep::batch("fan-out", 3).failing_sub_operations("rpc unavailable"));
    let h = Harness::with(
        WorkflowDefinition::builder("WG-112")
            .phase([fan.clone() as Arc<dyn Step>])
            .build(),
    );
    let ctx = run_ctx("WG-112");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;

    assert_eq!(applied(&dispositions, "do_step_error(1,1)"), 1);
    assert_eq!(applied(&dispositions, "do_step_end"), 0);
    assert!(fan.sub_operation_count() >= 1);
    assert_eq!(
        h.status(&at(&ctx, 1, 1), ExecutionAspect::Step).await,
        Some(ExecutionStatus::Error)
    );
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Error));
}

// ============================================================
// Failure cascade and verification
// ============================================================

#[tokio::test]
async fn step_failure_halts_the_run() {
    let ok = mocks(&["ok", "never"]);
    let boom = Arc::new(MockStep::failing("boom", "something broke irreparably"));
    let h = Harness::with(
        WorkflowDefinition::builder("WG-120")
            .phase([ok[0].clone() as Arc<dyn Step>, boom.clone() as Arc<dyn Step>])
            .phase([ok[1].clone() as Arc<dyn Step>])
            .build(),
    );
    let ctx = run_ctx("WG-120");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;

    assert_eq!(applied(&dispositions, "do_step_error(1,2)"), 1);
    assert_eq!(applied(&dispositions, "on_phase_error(1)"), 1);
    assert_eq!(applied(&dispositions, "on_run_error"), 1);
    assert_eq!(ok[1].call_count(), 0);

    let step = h
        .orchestrator
        .state()
        .get_info(&at(&ctx, 1, 2), ExecutionAspect::Step)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, ExecutionStatus::Error);
    assert!(step.error.unwrap().contains("something broke irreparably"));
    assert_eq!(h.status(&at(&ctx, 1, 0), ExecutionAspect::Phase).await, Some(ExecutionStatus::Error));
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Error));
    assert_eq!(h.stored(&ctx).await.status, ExecutionStatus::Error);

    // In-flight transitions for the halted run are discarded.
    let late = h
        .orchestrator
        .handle(OrchestrationMessage::OnPhaseEnd { ctx: at(&ctx, 1, 2) })
        .await
        .unwrap();
    assert!(matches!(late, Disposition::Dropped { reason, .. } if reason.contains("halted")));
}

#[tokio::test]
async fn ignorable_verification_failure_does_not_halt() {
    let checked = Arc::new(
        MockStep::done("check-balances")
            .verified_with(Err(VerificationError::ignorable("balance not yet visible"))),
    );
    let h = Harness::with(
        WorkflowDefinition::builder("WG-130")
            .phase([checked as Arc<dyn Step>])
            .build(),
    );
    let ctx = run_ctx("WG-130");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn fatal_verification_failure_halts() {
    let checked = Arc::new(
        MockStep::done("check-balances").verified_with(Err(VerificationError::fatal("balance mismatch"))),
    );
    let h = Harness::with(
        WorkflowDefinition::builder("WG-131")
            .phase([checked as Arc<dyn Step>])
            .build(),
    );
    let ctx = run_ctx("WG-131");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    let step = h
        .orchestrator
        .state()
        .get_info(&at(&ctx, 1, 1), ExecutionAspect::Step)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, ExecutionStatus::Error);
    assert!(step.error.unwrap().contains("balance mismatch"));
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Error));
}

// ============================================================
// Correlation
// ============================================================

fn funding_workflow() -> (WorkflowDefinition, Arc<MockStep>, Arc<MockStep>) {
    let setup = Arc::new(MockStep::done("setup"));
    let fund = Arc::new(MockStep::done("fund-users").awaiting_deploys(5));
    let transfer = Arc::new(MockStep::done("transfer"));
    let workflow = WorkflowDefinition::builder("WG-100")
        .phase([
            setup as Arc<dyn Step>,
            fund.clone() as Arc<dyn Step>,
            transfer.clone() as Arc<dyn Step>,
        ])
        .build();
    (workflow, fund, transfer)
}

fn finalized(n: u32) -> DeployFinalized {
    DeployFinalized::new(0, "block-1", format!("deploy-{n}"))
}

#[tokio::test]
async fn async_step_completes_on_the_confirming_deploy() {
    let (workflow, fund, transfer) = funding_workflow();
    let h = Harness::with(workflow);
    let ctx = run_ctx("WG-100");

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let dispositions = h.run_to_idle().await;
    assert_eq!(transitions(&dispositions).last().unwrap(), "do_step(1,2)");
    assert_eq!(fund.call_count(), 1);
    assert_eq!(h.queue.outstanding(), 0);

    let correlator = h.orchestrator.correlator();
    for n in 1..=4 {
        let outcome = correlator.on_deploy_finalized(&ctx, &finalized(n)).await.unwrap();
        assert_eq!(outcome, Correlation::Pending { deploy_count: n as u64 });
    }
    assert!(h.queue.pending(ORCHESTRATION_QUEUE).is_empty());

    // The same deploy reported twice is counted once.
    assert_eq!(
        correlator.on_deploy_finalized(&ctx, &finalized(4)).await.unwrap(),
        Correlation::Pending { deploy_count: 4 }
    );

    let outcome = correlator.on_deploy_finalized(&ctx, &finalized(5)).await.unwrap();
    assert_eq!(outcome, Correlation::Completed { next: "do_step(1,3)".into() });
    assert_eq!(
        h.queue.pending(ORCHESTRATION_QUEUE),
        vec![OrchestrationMessage::DoStep { ctx: at(&ctx, 1, 2) }]
    );
    assert_eq!(
        h.status(&at(&ctx, 1, 2), ExecutionAspect::Step).await,
        Some(ExecutionStatus::Complete)
    );

    let late = correlator.on_deploy_finalized(&ctx, &finalized(6)).await.unwrap();
    assert_eq!(late, Correlation::Ignored("step not in progress"));
    assert_eq!(h.queue.pending(ORCHESTRATION_QUEUE).len(), 1);

    h.run_to_idle().await;
    assert_eq!(transfer.call_count(), 1);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn correlate_messages_flow_through_the_worker() {
    let (workflow, _, _) = funding_workflow();
    let h = Harness::with(workflow);
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    for n in 1..=5 {
        let message = OrchestrationMessage::Correlate { ctx: ctx.clone(), event: finalized(n) };
        h.queue.send(message.queue(), message).await.unwrap();
    }
    let dispositions = h.run_to_idle().await;

    assert_eq!(applied(&dispositions, "correlate("), 5);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn deploy_event_retried_after_store_failure_is_still_counted() {
    let (workflow, _, transfer) = funding_workflow();
    let h = Harness::with(workflow);
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    // The third deploy is marked, but reading the count back fails.
    h.store.fail_once(StoreOp::GetByPattern, "deploy-count:LOC-01.WG-100.R-001.P-01.S-02", 2);
    for n in 1..=5 {
        let message = OrchestrationMessage::Correlate { ctx: ctx.clone(), event: finalized(n) };
        h.queue.send(message.queue(), message).await.unwrap();
    }
    let (_, failures) = h.run_with_redelivery().await;

    assert_eq!(failures, 1);
    assert_eq!(h.store.armed(), 0);
    assert_eq!(h.orchestrator.state().get_deploy_count(&at(&ctx, 1, 2)).await.unwrap(), 5);
    assert_eq!(transfer.call_count(), 1);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn verified_step_is_completed_when_its_record_write_is_retried() {
    let (workflow, _, transfer) = funding_workflow();
    let h = Harness::with(workflow);
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    // do_step(1,3) is queued, then marking (1,2) COMPLETE fails.
    h.store.fail_once(StoreOp::Set, "info:LOC-01.WG-100.R-001.P-01.S-02", 0);
    for n in 1..=5 {
        let message = OrchestrationMessage::Correlate { ctx: ctx.clone(), event: finalized(n) };
        h.queue.send(message.queue(), message).await.unwrap();
    }
    let (dispositions, failures) = h.run_with_redelivery().await;

    assert_eq!(failures, 1);
    assert_eq!(applied(&dispositions, "correlate("), 5);
    assert_eq!(transfer.call_count(), 1);
    assert_eq!(
        h.status(&at(&ctx, 1, 2), ExecutionAspect::Step).await,
        Some(ExecutionStatus::Complete)
    );
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Complete));
}

#[tokio::test]
async fn malformed_deploy_event_fails_the_step() {
    let (workflow, _, transfer) = funding_workflow();
    let h = Harness::with(workflow);
    let ctx = run_ctx("WG-100");
    h.orchestrator.submit(ctx.clone()).await.unwrap();
    h.run_to_idle().await;

    let event = DeployFinalized::new(0, "", "deploy-1");
    let outcome = h
        .orchestrator
        .correlator()
        .on_deploy_finalized(&ctx, &event)
        .await
        .unwrap();
    assert_eq!(outcome, Correlation::Failed);

    h.run_to_idle().await;
    assert_eq!(transfer.call_count(), 0);
    assert_eq!(h.status(&ctx, ExecutionAspect::Run).await, Some(ExecutionStatus::Error));
}

#[tokio::test]
async fn events_for_unknown_runs_are_ignored() {
    let (workflow, _, _) = funding_workflow();
    let h = Harness::with(workflow);
    let correlator = h.orchestrator.correlator();

    assert_eq!(
        correlator.on_deploy_finalized(&run_ctx("WG-999"), &finalized(1)).await.unwrap(),
        Correlation::Ignored("no pipeline table for run type")
    );
    assert_eq!(
        correlator.on_deploy_finalized(&run_ctx("WG-100"), &finalized(1)).await.unwrap(),
        Correlation::Ignored("run not found")
    );
}

// ============================================================
// Worker loop
// ============================================================

#[tokio::test]
async fn worker_runs_until_cancelled() {
    let steps = wg100_mocks();
    let h = Harness::with(wg100(&steps));
    let ctx = run_ctx("WG-100");
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(h.worker.clone().run(shutdown.clone()));

    h.orchestrator.submit(ctx.clone()).await.unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while h.status(&ctx, ExecutionAspect::Run).await != Some(ExecutionStatus::Complete) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "run did not complete");

    shutdown.cancel();
    handle.await.unwrap();
    assert!(steps.iter().all(|s| s.call_count() == 1));
}

// ============================================================
// Duplicate delivery property
// ============================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Re-enqueueing copies of arbitrary messages never changes the outcome.
    #[test]
    fn duplicate_deliveries_do_not_change_the_outcome(
        copies in proptest::collection::vec(0usize..3, 1..16)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let steps = wg100_mocks();
            let h = Harness::with(wg100(&steps));
            let ctx = run_ctx("WG-100");
            h.orchestrator.submit(ctx.clone()).await.unwrap();

            let mut delivered = 0usize;
            'deliver: loop {
                for queue in QUEUES {
                    if let Some(delivery) = h.queue.fetch(queue).await.unwrap() {
                        for _ in 0..copies[delivered % copies.len()] {
                            let copy = delivery.message.clone();
                            h.queue.send(copy.queue(), copy).await.unwrap();
                        }
                        h.orchestrator.handle(delivery.message).await.unwrap();
                        h.queue.complete(delivery.id).await.unwrap();
                        delivered += 1;
                        continue 'deliver;
                    }
                }
                break;
            }

            for step in &steps {
                prop_assert_eq!(step.call_count(), 1);
            }
            let infos = h.orchestrator.state().get_infos(&ctx).await.unwrap();
            prop_assert_eq!(infos.len(), 1 + 3 + 7);
            prop_assert!(infos.iter().all(|i| i.status == ExecutionStatus::Complete));
            prop_assert_eq!(h.stored(&ctx).await.status, ExecutionStatus::Complete);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
