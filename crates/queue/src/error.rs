//! Queue-level error type.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// `complete`/`fail` referenced a delivery that is not in flight.
    #[error("delivery {0} is not in flight")]
    UnknownDelivery(Uuid),
}
