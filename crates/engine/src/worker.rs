//! Queue consumer driving the orchestrator.

use std::sync::Arc;

use queue::{Delivery, MessageQueue};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::messages::{OrchestrationMessage, QUEUES};
use crate::pipeline::{Disposition, Orchestrator};
use crate::EngineError;

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
    config: EngineConfig,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn MessageQueue<OrchestrationMessage>>,
        config: EngineConfig,
    ) -> Self {
        Self { orchestrator, queue, config }
    }

    /// Handle at most one message; `None` when every queue is empty.
    ///
    /// A handler error fails the delivery back to the queue before it is
    /// returned.
    pub async fn tick(&self) -> Result<Option<Disposition>, EngineError> {
        for queue in QUEUES {
            if let Some(delivery) = self.queue.fetch(queue).await? {
                return self.process(delivery).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Handle messages until every queue is empty.  Returns how many were
    /// handled.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        while self.tick().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll with `concurrency` tasks until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker started"
        );

        let mut tasks = JoinSet::new();
        for slot in 0..self.config.concurrency.max(1) {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.poll(slot, shutdown).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task aborted");
            }
        }

        info!(worker = %self.config.worker_id, "worker stopped");
    }

    async fn poll(&self, slot: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.tick().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => warn!(slot, error = %err, "message handling failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn process(
        &self,
        delivery: Delivery<OrchestrationMessage>,
    ) -> Result<Disposition, EngineError> {
        let Delivery { id, attempts, message, .. } = delivery;
        match self.orchestrator.handle(message).await {
            Ok(disposition) => {
                self.queue.complete(id).await?;
                Ok(disposition)
            }
            Err(err) if err.is_infrastructure() => {
                warn!(delivery = %id, attempts, error = %err, "returning delivery to queue");
                self.queue.fail(id).await?;
                Err(err)
            }
            // Redelivery cannot change a domain failure.
            Err(err) => {
                error!(delivery = %id, attempts, error = %err, "discarding delivery");
                self.queue.complete(id).await?;
                Err(err)
            }
        }
    }
}
