//! `stests` CLI entry-point.
//!
//! Available sub-commands:
//! - `worker`   — consume orchestration, correlator and generator queues.
//! - `submit`   — start (or restart) a run.
//! - `finalize` — report a finalized deploy for a run.
//! - `flush`    — clear state and locks of a run or a whole network.
//! - `status`   — print a run's persisted state.
//! - `validate` — check every registered workload definition.
//! - `migrate`  — run pending database migrations.

mod workloads;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use engine::{EngineConfig, ExecutionAspect, OrchestrationMessage, Orchestrator, Worker};
use queue::{MemoryQueue, MessageQueue, PgQueue};
use steps::{DeployFinalized, ExecutionContext};
use store::{KvStore, MemoryStore, PgStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "stests",
    about = "Distributed workload orchestration for blockchain test networks",
    version
)]
struct Cli {
    /// Postgres connection string.  Without it state and queues live in
    /// this process only.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "STESTS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Network under test, e.g. `LOC-01`.
    #[arg(long, env = "STESTS_NETWORK")]
    network: String,
    /// Workload type, e.g. `WG-100`.
    #[arg(long)]
    run_type: String,
    /// Run index (1-based).
    #[arg(long, default_value_t = 1)]
    run: u32,
}

impl RunArgs {
    fn context(&self, args: serde_json::Value) -> ExecutionContext {
        ExecutionContext::new(self.network.as_str(), self.run_type.as_str(), self.run, args)
    }
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long, env = "STESTS_WORKER_ID")]
    worker_id: Option<String>,
    #[arg(long, default_value_t = 4, env = "STESTS_CONCURRENCY")]
    concurrency: usize,
    #[arg(long, default_value_t = 250, env = "STESTS_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,
    #[arg(long, default_value_t = 3, env = "STESTS_MAX_ATTEMPTS")]
    max_attempts: u32,
    /// Default jitter window for batch dispatch.
    #[arg(long, default_value_t = 0, env = "STESTS_DISPATCH_WINDOW_MS")]
    dispatch_window_ms: u64,
}

impl WorkerArgs {
    fn config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
            dispatch_window: Duration::from_millis(self.dispatch_window_ms),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start a worker that processes queued messages.
    Worker {
        #[command(flatten)]
        worker: WorkerArgs,
        /// Exit once every queue is empty instead of polling forever.
        #[arg(long)]
        drain: bool,
    },
    /// Submit a run.
    Submit {
        #[command(flatten)]
        run: RunArgs,
        /// Workload arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Node deploys are dispatched to.
        #[arg(long, default_value_t = 0)]
        node: u32,
        /// Process the run in this process until the queues are idle.
        #[arg(long)]
        drain: bool,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Report a finalized deploy to the correlator.
    Finalize {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        block_hash: String,
        #[arg(long)]
        deploy_hash: String,
        /// Node that observed the finalization.
        #[arg(long, default_value_t = 0)]
        node: u32,
    },
    /// Clear persisted state and locks.
    Flush {
        #[arg(long, env = "STESTS_NETWORK")]
        network: String,
        /// Limit the flush to one run (requires `--run`).
        #[arg(long, requires = "run")]
        run_type: Option<String>,
        #[arg(long, requires = "run_type")]
        run: Option<u32>,
    },
    /// Print the persisted state of a run.
    Status {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Validate every registered workload definition.
    Validate,
    /// Run pending database migrations.
    Migrate,
}

/// Store and queue shared by every command.
struct Backend {
    store: Arc<dyn KvStore>,
    queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
}

async fn connect(database_url: Option<&str>, max_attempts: u32) -> anyhow::Result<Backend> {
    match database_url {
        Some(url) => {
            let pool = store::pool::create_pool(url, 10)
                .await
                .context("failed to connect to database")?;
            Ok(Backend {
                store: Arc::new(PgStore::new(pool.clone())),
                queue: Arc::new(PgQueue::<OrchestrationMessage>::with_max_attempts(
                    pool,
                    max_attempts as i32,
                )),
            })
        }
        None => {
            warn!("DATABASE_URL not set; state and queues are local to this process");
            Ok(Backend {
                store: Arc::new(MemoryStore::new()),
                queue: Arc::new(MemoryQueue::<OrchestrationMessage>::new(max_attempts)),
            })
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let registry = Arc::new(workloads::registry());
    let database_url = cli.database_url.as_deref();

    match cli.command {
        Command::Worker { worker, drain } => {
            let config = worker.config();
            let backend = connect(database_url, config.max_attempts).await?;
            let span = info_span!("worker", id = %config.worker_id);
            let orchestrator = Arc::new(Orchestrator::new(
                registry,
                backend.store,
                backend.queue.clone(),
                config.clone(),
                span,
            ));
            let worker = Arc::new(Worker::new(orchestrator, backend.queue, config));

            if drain {
                let handled = worker.drain().await?;
                info!(handled, "queues drained");
            } else {
                let shutdown = CancellationToken::new();
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                        signal.cancel();
                    }
                });
                worker.run(shutdown).await;
            }
        }

        Command::Submit { run, args, node, drain, worker } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !args.is_object() {
                bail!("--args must be a JSON object");
            }
            let config = worker.config();
            let backend = connect(database_url, config.max_attempts).await?;
            let orchestrator = Arc::new(Orchestrator::new(
                registry,
                backend.store,
                backend.queue.clone(),
                config.clone(),
                info_span!("submit"),
            ));

            let ctx = run.context(args).with_node_index(node);
            orchestrator.submit(ctx.clone()).await?;
            println!("submitted {} {} {}", ctx.network, ctx.run_type, ctx.run_index_label());

            if drain {
                let worker = Worker::new(orchestrator.clone(), backend.queue, config);
                let handled = worker.drain().await?;
                info!(handled, "queues drained");
                print_status(&orchestrator, &ctx).await?;
            }
        }

        Command::Finalize { run, block_hash, deploy_hash, node } => {
            let backend = connect(database_url, EngineConfig::default().max_attempts).await?;
            let message = OrchestrationMessage::Correlate {
                ctx: run.context(serde_json::Value::Null),
                event: DeployFinalized::new(node, block_hash, deploy_hash),
            };
            backend.queue.send(message.queue(), message).await?;
            println!("deploy event queued");
        }

        Command::Flush { network, run_type, run } => {
            let backend = connect(database_url, EngineConfig::default().max_attempts).await?;
            let state = engine::ExecutionStateStore::new(backend.store);
            let removed = match (run_type, run) {
                (Some(run_type), Some(run)) => {
                    let ctx = ExecutionContext::new(network, run_type, run, serde_json::Value::Null);
                    state.flush_by_run(&ctx).await? + state.flush_locks(&ctx).await?
                }
                _ => state.flush_by_network(&network).await?,
            };
            println!("flushed {removed} keys");
        }

        Command::Status { run } => {
            let backend = connect(database_url, EngineConfig::default().max_attempts).await?;
            let orchestrator = Orchestrator::new(
                registry,
                backend.store,
                backend.queue,
                EngineConfig::default(),
                info_span!("status"),
            );
            print_status(&orchestrator, &run.context(serde_json::Value::Null)).await?;
        }

        Command::Validate => {
            let mut failed = false;
            for run_type in registry.run_types() {
                let workflow = registry.resolve(run_type)?;
                match workflow.validate() {
                    Ok(()) => println!(
                        "{run_type}: ok ({} phases, {} steps) {}",
                        workflow.phase_count(),
                        workflow.step_count(),
                        workflow.description()
                    ),
                    Err(e) => {
                        eprintln!("{run_type}: {e}");
                        failed = true;
                    }
                }
            }
            if failed {
                bail!("invalid workload definitions");
            }
        }

        Command::Migrate => {
            let Some(url) = database_url else {
                bail!("DATABASE_URL is required for migrations");
            };
            let pool = store::pool::create_pool(url, 2)
                .await
                .context("failed to connect to database")?;
            store::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn print_status(orchestrator: &Orchestrator, ctx: &ExecutionContext) -> anyhow::Result<()> {
    let state = orchestrator.state();
    let Some(stored) = state.get_context(ctx).await? else {
        println!("{} {} {}: not found", ctx.network, ctx.run_type, ctx.run_index_label());
        return Ok(());
    };

    println!(
        "{} {} {}: {} at {}.{}",
        stored.network,
        stored.run_type,
        stored.run_index_label(),
        stored.status,
        stored.phase_index_label(),
        stored.step_index_label()
    );
    for info in state.get_infos(ctx).await? {
        let label = match info.aspect() {
            ExecutionAspect::Step => info.step_label.clone().unwrap_or_default(),
            aspect => aspect.to_string(),
        };
        let duration = info
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "  {:<10} {:<20} {:<12} {:>8} {}",
            info.address(),
            label,
            info.status.to_string(),
            duration,
            info.error.as_deref().unwrap_or("")
        );
    }
    if let Ok(count) = state.get_deploy_count(&stored).await {
        if count > 0 {
            println!("  deploys correlated to current step: {count}");
        }
    }
    Ok(())
}
