//! Fan-out barrier over the shared key-value store.
//!
//! A task set of `total` members is opened with a completion continuation
//! and an optional failure continuation.  Each member reports once; the
//! continuation is handed back to the reporter whose report completed the
//! set, or to the first member that fails.  Reports are idempotent per
//! member: a redelivered report is not counted twice, and a redelivered
//! report from the member that fired gets the continuation again.
//!
//! Keys written under the barrier id:
//! - `{id}.meta`      — serialized totals and continuations
//! - `{id}.M-{n}`     — member report marker, `ok` or `failed`
//! - `{id}.fired`     — continuation claim, holding the firing member

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use store::KvStore;
use tracing::{debug, warn};

use crate::QueueError;

const SUCCEEDED: &str = "ok";
const FAILED: &str = "failed";

#[derive(Debug, Serialize, Deserialize)]
struct BarrierRecord<M> {
    total: u64,
    on_complete: M,
    on_failure: Option<M>,
}

pub struct TaskSet<M> {
    store: Arc<dyn KvStore>,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for TaskSet<M> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), _message: PhantomData }
    }
}

impl<M> TaskSet<M>
where
    M: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, _message: PhantomData }
    }

    /// Register a barrier of `total` members.  Must precede member dispatch.
    pub async fn open(
        &self,
        id: &str,
        total: u64,
        on_complete: M,
        on_failure: Option<M>,
    ) -> Result<(), QueueError> {
        let record = BarrierRecord { total, on_complete, on_failure };
        let raw = serde_json::to_string(&record)?;
        self.store.set(&format!("{id}.meta"), &raw).await?;
        debug!(barrier = id, total, "task set opened");
        Ok(())
    }

    /// Report a successful member; returns the continuation if this report
    /// completed the set.
    pub async fn record_success(&self, id: &str, member: u64) -> Result<Option<M>, QueueError> {
        if !self.claim_member(id, member, SUCCEEDED).await? {
            return Ok(None);
        }
        let Some(record) = self.record(id).await? else {
            return Ok(None);
        };
        if self.succeeded(id).await? < record.total {
            return Ok(None);
        }
        if self.claim_fire(id, member).await? {
            Ok(Some(record.on_complete))
        } else {
            Ok(None)
        }
    }

    /// Report a failed member; returns the failure continuation if this is
    /// the first report to fire the set.
    pub async fn record_failure(&self, id: &str, member: u64) -> Result<Option<M>, QueueError> {
        if !self.claim_member(id, member, FAILED).await? {
            return Ok(None);
        }
        let Some(record) = self.record(id).await? else {
            return Ok(None);
        };
        if self.claim_fire(id, member).await? {
            Ok(record.on_failure)
        } else {
            Ok(None)
        }
    }

    /// `true` when the member's report stands as `outcome`, whether written
    /// now or by an earlier delivery of the same report.
    async fn claim_member(&self, id: &str, member: u64, outcome: &str) -> Result<bool, QueueError> {
        let (previous, acquired) = self
            .store
            .set_if_absent(&format!("{id}.M-{member}"), outcome)
            .await?;
        match previous {
            Some(previous) if !acquired && previous != outcome => {
                debug!(barrier = id, member, %previous, "conflicting member report ignored");
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Members that reported success so far.
    async fn succeeded(&self, id: &str) -> Result<u64, QueueError> {
        let reports = self.store.get_by_pattern(&format!("{id}.M-*")).await?;
        Ok(reports.iter().filter(|r| r.as_str() == SUCCEEDED).count() as u64)
    }

    /// `true` for the member that fires the set, including on redelivery.
    async fn claim_fire(&self, id: &str, member: u64) -> Result<bool, QueueError> {
        let marker = member.to_string();
        let (previous, acquired) = self.store.set_if_absent(&format!("{id}.fired"), &marker).await?;
        Ok(acquired || previous.as_deref() == Some(marker.as_str()))
    }

    async fn record(&self, id: &str) -> Result<Option<BarrierRecord<M>>, QueueError> {
        match self.store.get(&format!("{id}.meta")).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                warn!(barrier = id, "task set not found - flushed or never opened");
                Ok(None)
            }
        }
    }
}
