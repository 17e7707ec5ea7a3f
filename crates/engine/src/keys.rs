//! Store key layout.
//!
//! `{category}:{network}.{run_type}.{R-###}.{aspect}` where the aspect is
//! `-` for run records, `P-##` for a phase and `P-##.S-##` for a step.  The
//! `-` segment keeps run records inside the run's `R-###.*` subtree.

use steps::ExecutionContext;
use store::Keypath;

use crate::models::ExecutionAspect;

pub const CONTEXT: &str = "context";
pub const INFO: &str = "info";
pub const LOCK: &str = "lock";
pub const DEPLOY_COUNT: &str = "deploy-count";
pub const BARRIER: &str = "barrier";

/// Categories cleared when a run starts afresh.  Locks are flushed separately.
pub const RUN_CACHE: [&str; 4] = [CONTEXT, INFO, DEPLOY_COUNT, BARRIER];

/// Every category the engine writes.
pub const ALL: [&str; 5] = [CONTEXT, INFO, LOCK, DEPLOY_COUNT, BARRIER];

pub fn network(category: &str, network: &str) -> Keypath {
    Keypath::new(category).push(network)
}

pub fn run(category: &str, ctx: &ExecutionContext) -> Keypath {
    network(category, &ctx.network)
        .push(ctx.run_type.as_str())
        .push(ctx.run_index_label())
}

pub fn aspect(category: &str, ctx: &ExecutionContext, aspect: ExecutionAspect) -> Keypath {
    let path = run(category, ctx);
    match aspect {
        ExecutionAspect::Run => path.push("-"),
        ExecutionAspect::Phase => path.push(ctx.phase_index_label()),
        ExecutionAspect::Step => path
            .push(ctx.phase_index_label())
            .push(ctx.step_index_label()),
    }
}
