//! Tuning knobs for a worker process.

use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Written into lock markers.
    pub worker_id: String,
    /// Messages processed concurrently by one worker.
    pub concurrency: usize,
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    /// Deliveries before a message is dead-lettered.
    pub max_attempts: u32,
    /// Jitter window for batches that do not set their own.
    pub dispatch_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            dispatch_window: Duration::ZERO,
        }
    }
}
