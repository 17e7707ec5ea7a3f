//! `queue` crate — message transport between orchestration workers.
//!
//! Delivery is at-least-once: a fetched message stays in flight until the
//! consumer completes it, and is handed out again when the consumer fails
//! it.  Consumers are expected to be idempotent.
//!
//! [`TaskSet`] adds a fan-out barrier on top of the shared key-value store
//! so a continuation fires exactly once after a batch of messages has been
//! processed, whichever worker processed them.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod taskset;
pub mod traits;

pub use error::QueueError;
pub use memory::MemoryQueue;
pub use postgres::PgQueue;
pub use taskset::TaskSet;
pub use traits::{Delivery, MessageQueue};
