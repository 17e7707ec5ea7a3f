//! Distributed locks gating every state transition.
//!
//! A lock is a store key written with set-if-absent.  Locks never expire
//! and are never released mid-run; they are flushed in bulk when the run is
//! submitted again.

use std::sync::Arc;

use chrono::Utc;
use steps::ExecutionContext;
use store::{KvStore, Keypath};
use tracing::debug;

use crate::keys;
use crate::models::ExecutionAspect;
use crate::EngineError;

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lock {
    Run,
    Phase,
    Step,
    /// One finalized deploy correlated to the current step.  Held under the
    /// step's `deploy-count` subtree: the step's deploy count is the number
    /// of these markers.
    Deploy { deploy_hash: String },
}

impl Lock {
    pub fn keypath(&self, ctx: &ExecutionContext) -> Keypath {
        match self {
            Self::Run => keys::aspect(keys::LOCK, ctx, ExecutionAspect::Run),
            Self::Phase => keys::aspect(keys::LOCK, ctx, ExecutionAspect::Phase),
            Self::Step => keys::aspect(keys::LOCK, ctx, ExecutionAspect::Step),
            Self::Deploy { deploy_hash } => {
                keys::aspect(keys::DEPLOY_COUNT, ctx, ExecutionAspect::Step)
                    .push(deploy_hash.as_str())
            }
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    owner: String,
}

impl DistributedLock {
    /// `owner` is recorded in the lock marker, typically the worker id.
    pub fn new(store: Arc<dyn KvStore>, owner: impl Into<String>) -> Self {
        Self { store, owner: owner.into() }
    }

    /// Try to take `lock` for `ctx`.
    ///
    /// Returns the marker of the current holder (if any) and whether this
    /// caller acquired the lock.  Among concurrent callers exactly one wins.
    pub async fn acquire(
        &self,
        lock: &Lock,
        ctx: &ExecutionContext,
    ) -> Result<(Option<String>, bool), EngineError> {
        let key = lock.keypath(ctx).key();
        let marker = format!("{}@{}", self.owner, Utc::now().to_rfc3339());
        let (previous, acquired) = self.store.set_if_absent(&key, &marker).await?;
        debug!(%key, acquired, "lock acquire");
        Ok((previous, acquired))
    }

    /// Like [`Self::acquire`] but maps a lost race onto
    /// [`EngineError::LockNotAcquired`].
    pub async fn claim(&self, lock: &Lock, ctx: &ExecutionContext) -> Result<(), EngineError> {
        match self.acquire(lock, ctx).await? {
            (_, true) => Ok(()),
            (_, false) => Err(EngineError::LockNotAcquired { key: lock.keypath(ctx).key() }),
        }
    }
}
