//! The `MessageQueue` trait.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::QueueError;

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub id: Uuid,
    pub queue: String,
    pub message: M,
    /// Number of times this message has been handed out, including this one.
    pub attempts: u32,
}

/// Named queues with at-least-once delivery.
#[async_trait]
pub trait MessageQueue<M>: Send + Sync
where
    M: Send + 'static,
{
    /// Enqueue `message` on `queue` for immediate delivery.
    async fn send(&self, queue: &str, message: M) -> Result<(), QueueError> {
        self.send_with_delay(queue, message, Duration::ZERO).await
    }

    /// Enqueue `message` on `queue`, deliverable once `delay` has elapsed.
    async fn send_with_delay(
        &self,
        queue: &str,
        message: M,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Claim the oldest deliverable message on `queue`, if any.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery<M>>, QueueError>;

    /// Acknowledge a delivery; it will not be handed out again.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Reject a delivery; it is redelivered unless attempts are exhausted.
    async fn fail(&self, id: Uuid) -> Result<(), QueueError>;
}
