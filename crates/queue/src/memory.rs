//! In-process `MessageQueue` for single-process deployments and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::{Delivery, MessageQueue, QueueError};

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct Entry<M> {
    id: Uuid,
    seq: u64,
    queue: String,
    message: M,
    available_at: Instant,
    attempts: u32,
}

#[derive(Debug)]
struct Inner<M> {
    next_seq: u64,
    pending: Vec<Entry<M>>,
    in_flight: HashMap<Uuid, Entry<M>>,
    dead_lettered: Vec<Entry<M>>,
}

/// Queue held entirely in memory; messages are lost with the process.
#[derive(Debug)]
pub struct MemoryQueue<M> {
    inner: Mutex<Inner<M>>,
    max_attempts: u32,
}

impl<M> Default for MemoryQueue<M> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl<M> MemoryQueue<M> {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 0,
                pending: Vec::new(),
                in_flight: HashMap::new(),
                dead_lettered: Vec::new(),
            }),
            max_attempts: max_attempts.max(1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages waiting on `queue` (deliverable or delayed), oldest first.
    pub fn pending(&self, queue: &str) -> Vec<M>
    where
        M: Clone,
    {
        let inner = self.inner();
        let mut entries: Vec<&Entry<M>> =
            inner.pending.iter().filter(|e| e.queue == queue).collect();
        entries.sort_by_key(|e| (e.available_at, e.seq));
        entries.into_iter().map(|e| e.message.clone()).collect()
    }

    /// Total messages waiting or in flight across all queues.
    pub fn outstanding(&self) -> usize {
        let inner = self.inner();
        inner.pending.len() + inner.in_flight.len()
    }

    /// Messages that exhausted their delivery attempts.
    pub fn dead_lettered(&self) -> Vec<M>
    where
        M: Clone,
    {
        self.inner().dead_lettered.iter().map(|e| e.message.clone()).collect()
    }
}

#[async_trait]
impl<M> MessageQueue<M> for MemoryQueue<M>
where
    M: Clone + Send + 'static,
{
    async fn send_with_delay(
        &self,
        queue: &str,
        message: M,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push(Entry {
            id: Uuid::new_v4(),
            seq,
            queue: queue.to_owned(),
            message,
            available_at: Instant::now() + delay,
            attempts: 0,
        });
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery<M>>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner();

        let next = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.queue == queue && e.available_at <= now)
            .min_by_key(|(_, e)| (e.available_at, e.seq))
            .map(|(i, _)| i);

        let Some(index) = next else {
            return Ok(None);
        };

        let mut entry = inner.pending.remove(index);
        entry.attempts += 1;
        let delivery = Delivery {
            id: entry.id,
            queue: entry.queue.clone(),
            message: entry.message.clone(),
            attempts: entry.attempts,
        };
        inner.in_flight.insert(entry.id, entry);
        Ok(Some(delivery))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.inner()
            .in_flight
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(id))
    }

    async fn fail(&self, id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner();
        let mut entry = inner
            .in_flight
            .remove(&id)
            .ok_or(QueueError::UnknownDelivery(id))?;

        if entry.attempts >= self.max_attempts {
            warn!(queue = %entry.queue, attempts = entry.attempts, "message dead-lettered");
            inner.dead_lettered.push(entry);
        } else {
            entry.available_at = Instant::now();
            inner.pending.push(entry);
        }
        Ok(())
    }
}
