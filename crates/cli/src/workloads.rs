//! Workload definitions known to this binary.

use std::sync::Arc;

use engine::{WorkflowDefinition, WorkflowRegistry};
use steps::builtin::{AwaitDeploysStep, LoggingStep};
use steps::Step;

fn log(label: &str, description: &str) -> Arc<dyn Step> {
    Arc::new(LoggingStep::new(label, description))
}

fn await_deploys(label: &str, count_arg: &str) -> Arc<dyn Step> {
    Arc::new(AwaitDeploysStep::new(label, count_arg))
}

/// WG-100: fund users from a faucet, then have them transfer.
///
/// Run arguments: `user_accounts` (deploys awaited per funding round) and
/// `transfers` (deploys awaited for the transfer round).
fn wg100() -> WorkflowDefinition {
    WorkflowDefinition::builder("WG-100")
        .description("faucet funding then native transfers")
        .phase([
            log("create-accounts", "derive faucet and user accounts"),
            log("fund-faucet", "dispatch faucet funding deploy"),
            await_deploys("fund-users", "user_accounts"),
        ])
        .phase([log("refund-check", "verify faucet balances")])
        .phase([
            log("dispatch-transfers", "dispatch user transfers"),
            await_deploys("await-transfers", "transfers"),
            log("report", "summarise run"),
        ])
        .build()
}

/// WG-200: a single round of deploys, for smoke testing a network.
fn wg200() -> WorkflowDefinition {
    WorkflowDefinition::builder("WG-200")
        .description("single deploy round")
        .phase([
            log("dispatch", "dispatch deploys"),
            await_deploys("await-deploys", "deploys"),
        ])
        .build()
}

pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register(wg100()).register(wg200());
    registry
}
