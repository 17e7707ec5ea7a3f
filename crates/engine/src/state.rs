//! Typed access to execution state held in the shared store.
//!
//! Contexts and info records are plain upserts; the only compare-and-set in
//! the engine is the lock (see [`crate::lock`]).  Deploy counts are the
//! number of per-deploy lock markers under the step.

use std::sync::Arc;

use steps::{ExecutionContext, ExecutionStatus};
use store::KvStore;
use tracing::{debug, warn};

use crate::codec::{decode, encode};
use crate::keys;
use crate::models::{ExecutionAspect, ExecutionInfo};
use crate::EngineError;

#[derive(Clone)]
pub struct ExecutionStateStore {
    store: Arc<dyn KvStore>,
}

impl ExecutionStateStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Contexts
    // -----------------------------------------------------------------------

    pub async fn set_context(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let key = keys::aspect(keys::CONTEXT, ctx, ExecutionAspect::Run).key();
        self.store.set(&key, &encode(ctx)?).await?;
        Ok(())
    }

    /// Last persisted context of the run `ctx` belongs to.
    pub async fn get_context(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let key = keys::aspect(keys::CONTEXT, ctx, ExecutionAspect::Run).key();
        self.store
            .get(&key)
            .await?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Persisted contexts on `network`, optionally limited to one run type.
    pub async fn get_contexts(
        &self,
        network: &str,
        run_type: Option<&str>,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        let mut path = keys::network(keys::CONTEXT, network);
        if let Some(run_type) = run_type {
            path = path.push(run_type);
        }
        self.decode_all(&path.subtree()).await
    }

    // -----------------------------------------------------------------------
    // Info records
    // -----------------------------------------------------------------------

    pub async fn set_info(&self, info: &ExecutionInfo) -> Result<(), EngineError> {
        let mut ctx = ExecutionContext::new(
            info.network.as_str(),
            info.run_type.as_str(),
            info.run_index,
            serde_json::Value::Null,
        );
        ctx.phase_index = info.phase_index.unwrap_or(0);
        ctx.step_index = info.step_index.unwrap_or(0);

        let key = keys::aspect(keys::INFO, &ctx, info.aspect()).key();
        self.store.set(&key, &encode(info)?).await?;
        Ok(())
    }

    pub async fn get_info(
        &self,
        ctx: &ExecutionContext,
        aspect: ExecutionAspect,
    ) -> Result<Option<ExecutionInfo>, EngineError> {
        let key = keys::aspect(keys::INFO, ctx, aspect).key();
        self.store
            .get(&key)
            .await?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Every info record of the run, run record first, then in key order.
    pub async fn get_infos(&self, ctx: &ExecutionContext) -> Result<Vec<ExecutionInfo>, EngineError> {
        self.decode_all(&keys::run(keys::INFO, ctx).subtree()).await
    }

    /// Step records of the run in execution order.
    pub async fn get_step_infos(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Vec<ExecutionInfo>, EngineError> {
        let mut steps: Vec<ExecutionInfo> = self
            .get_infos(ctx)
            .await?
            .into_iter()
            .filter(|info| info.aspect() == ExecutionAspect::Step)
            .collect();
        steps.sort_by_key(|info| (info.phase_index, info.step_index));
        Ok(steps)
    }

    /// The furthest step of the run still IN_PROGRESS.
    pub async fn get_pending_step(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionInfo>, EngineError> {
        Ok(self
            .get_step_infos(ctx)
            .await?
            .into_iter()
            .rev()
            .find(|info| info.status == ExecutionStatus::InProgress))
    }

    /// Record `info` as PENDING, then advance it to IN_PROGRESS.
    pub async fn start_info(
        &self,
        ctx: &ExecutionContext,
        info: &ExecutionInfo,
    ) -> Result<(), EngineError> {
        let mut pending = info.clone();
        pending.status = ExecutionStatus::Pending;
        self.set_info(&pending).await?;
        self.update_info(ctx, info.aspect(), ExecutionStatus::InProgress, None).await?;
        Ok(())
    }

    /// Move a record to `status`.
    ///
    /// Returns `false` without writing when the record is missing or the
    /// move would regress the status.  Terminal statuses stamp end time and
    /// duration.
    pub async fn update_info(
        &self,
        ctx: &ExecutionContext,
        aspect: ExecutionAspect,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, EngineError> {
        let Some(mut info) = self.get_info(ctx, aspect).await? else {
            warn!(run = %ctx.run_index_label(), %aspect, "no info record to update");
            return Ok(false);
        };
        if !info.status.can_advance_to(status) {
            debug!(
                run = %ctx.run_index_label(),
                %aspect,
                from = %info.status,
                to = %status,
                "status update rejected"
            );
            return Ok(false);
        }

        if status.is_terminal() {
            info.finalise(status, error);
        } else {
            info.status = status;
        }
        self.set_info(&info).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Deploy counters
    // -----------------------------------------------------------------------

    /// Number of distinct deploys correlated to the step of `ctx`: one
    /// [`Lock::Deploy`](crate::lock::Lock::Deploy) marker per deploy hash.
    pub async fn get_deploy_count(&self, ctx: &ExecutionContext) -> Result<u64, EngineError> {
        let pattern = keys::aspect(keys::DEPLOY_COUNT, ctx, ExecutionAspect::Step).subtree();
        let markers = self.store.get_by_pattern(&pattern).await?;
        Ok(markers.len() as u64)
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    /// Clear the run's cached state: contexts, info, deploy counts, barriers.
    pub async fn flush_by_run(&self, ctx: &ExecutionContext) -> Result<u64, EngineError> {
        let mut removed = 0;
        for category in keys::RUN_CACHE {
            removed += self
                .store
                .delete_by_pattern(&keys::run(category, ctx).subtree())
                .await?;
        }
        debug!(run = %ctx.run_index_label(), removed, "run cache flushed");
        Ok(removed)
    }

    /// Clear every lock held for the run.
    pub async fn flush_locks(&self, ctx: &ExecutionContext) -> Result<u64, EngineError> {
        let removed = self
            .store
            .delete_by_pattern(&keys::run(keys::LOCK, ctx).subtree())
            .await?;
        debug!(run = %ctx.run_index_label(), removed, "run locks flushed");
        Ok(removed)
    }

    /// Clear all engine state, locks included, for `network`.
    pub async fn flush_by_network(&self, network: &str) -> Result<u64, EngineError> {
        let mut removed = 0;
        for category in keys::ALL {
            removed += self
                .store
                .delete_by_pattern(&keys::network(category, network).subtree())
                .await?;
        }
        Ok(removed)
    }

    async fn decode_all<T>(&self, pattern: &str) -> Result<Vec<T>, EngineError>
    where
        T: serde::de::DeserializeOwned,
    {
        self.store
            .get_by_pattern(pattern)
            .await?
            .iter()
            .map(|raw| decode(raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{DistributedLock, Lock};
    use serde_json::json;
    use store::mock::FlakyStore;
    use store::MemoryStore;

    fn at(phase: u32, step: u32) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("LOC-01", "WG-100", 1, json!({}));
        ctx.phase_index = phase;
        ctx.step_index = step;
        ctx
    }

    fn state() -> (Arc<MemoryStore>, ExecutionStateStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ExecutionStateStore::new(store))
    }

    #[tokio::test]
    async fn context_is_stored_per_run() {
        let (_, state) = state();
        state.set_context(&at(1, 2)).await.unwrap();
        state.set_context(&at(1, 3)).await.unwrap();

        let stored = state.get_context(&at(0, 0)).await.unwrap().unwrap();
        assert_eq!((stored.phase_index, stored.step_index), (1, 3));
        assert_eq!(state.get_contexts("LOC-01", Some("WG-100")).await.unwrap().len(), 1);
        assert!(state.get_contexts("LOC-02", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_updates_are_monotonic() {
        let (_, state) = state();
        let ctx = at(1, 1);
        state.set_info(&ExecutionInfo::for_step(&ctx, "a")).await.unwrap();

        assert!(state
            .update_info(&ctx, ExecutionAspect::Step, ExecutionStatus::Complete, None)
            .await
            .unwrap());
        assert!(!state
            .update_info(&ctx, ExecutionAspect::Step, ExecutionStatus::Error, Some("late".into()))
            .await
            .unwrap());

        let info = state.get_info(&ctx, ExecutionAspect::Step).await.unwrap().unwrap();
        assert_eq!(info.status, ExecutionStatus::Complete);
        assert!(info.error.is_none());
        assert!(info.duration_ms.is_some());
    }

    #[tokio::test]
    async fn records_start_pending_then_advance() {
        let store = Arc::new(FlakyStore::new());
        let state = ExecutionStateStore::new(store.clone());
        let ctx = at(0, 0);
        state.start_info(&ctx, &ExecutionInfo::for_run(&ctx)).await.unwrap();

        let statuses: Vec<ExecutionStatus> = store
            .writes()
            .iter()
            .filter(|(key, _)| key == "info:LOC-01.WG-100.R-001.-")
            .map(|(_, raw)| decode::<ExecutionInfo>(raw).unwrap().status)
            .collect();
        assert_eq!(statuses, vec![ExecutionStatus::Pending, ExecutionStatus::InProgress]);
    }

    #[tokio::test]
    async fn missing_record_is_not_updated() {
        let (_, state) = state();
        assert!(!state
            .update_info(&at(1, 0), ExecutionAspect::Phase, ExecutionStatus::Complete, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pending_step_is_the_furthest_in_progress() {
        let (_, state) = state();
        state.set_info(&ExecutionInfo::for_run(&at(0, 0))).await.unwrap();
        state.set_info(&ExecutionInfo::for_phase(&at(1, 0))).await.unwrap();
        for (p, s) in [(1, 1), (1, 2), (2, 1)] {
            state.start_info(&at(p, s), &ExecutionInfo::for_step(&at(p, s), "x")).await.unwrap();
        }

        let pending = state.get_pending_step(&at(0, 0)).await.unwrap().unwrap();
        assert_eq!((pending.phase_index, pending.step_index), (Some(2), Some(1)));

        state
            .update_info(&at(2, 1), ExecutionAspect::Step, ExecutionStatus::Complete, None)
            .await
            .unwrap();
        let pending = state.get_pending_step(&at(0, 0)).await.unwrap().unwrap();
        assert_eq!((pending.phase_index, pending.step_index), (Some(1), Some(2)));
        assert_eq!(state.get_step_infos(&at(0, 0)).await.unwrap().len(), 3);
        assert_eq!(state.get_infos(&at(0, 0)).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn deploy_counts_are_per_step() {
        let (store, state) = state();
        let locks = DistributedLock::new(store, "w");
        for (step, hash) in [(2, "d-1"), (2, "d-2"), (3, "d-3")] {
            let deploy = Lock::Deploy { deploy_hash: hash.into() };
            assert!(locks.acquire(&deploy, &at(1, step)).await.unwrap().1);
        }
        // The same deploy seen again adds no marker.
        let again = Lock::Deploy { deploy_hash: "d-2".into() };
        assert!(!locks.acquire(&again, &at(1, 2)).await.unwrap().1);

        assert_eq!(state.get_deploy_count(&at(1, 2)).await.unwrap(), 2);
        assert_eq!(state.get_deploy_count(&at(1, 3)).await.unwrap(), 1);
        assert_eq!(state.get_deploy_count(&at(2, 1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_flush_keeps_locks_and_other_runs() {
        let (store, state) = state();
        let ctx = at(1, 1);
        let mut other = at(1, 1);
        other.run_index = 10;

        state.set_context(&ctx).await.unwrap();
        state.set_context(&other).await.unwrap();
        state.set_info(&ExecutionInfo::for_step(&ctx, "a")).await.unwrap();
        let locks = DistributedLock::new(store.clone(), "w");
        locks.claim(&Lock::Deploy { deploy_hash: "d-1".into() }, &ctx).await.unwrap();
        locks.claim(&Lock::Step, &ctx).await.unwrap();

        assert_eq!(state.flush_by_run(&ctx).await.unwrap(), 3);
        assert!(state.get_context(&ctx).await.unwrap().is_none());
        assert!(state.get_context(&other).await.unwrap().is_some());
        assert_eq!(store.keys(), vec![
            "context:LOC-01.WG-100.R-010.-".to_string(),
            "lock:LOC-01.WG-100.R-001.P-01.S-01".to_string(),
        ]);

        assert_eq!(state.flush_locks(&ctx).await.unwrap(), 1);
        assert_eq!(state.flush_by_network("LOC-01").await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
