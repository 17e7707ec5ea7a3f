//! Test double: a [`MemoryStore`] that fails selected operations on demand.
//!
//! Used to exercise the redelivery path of components built on the store.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{KvStore, MemoryStore, StoreError};

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    GetByPattern,
    Set,
    SetIfAbsent,
    Increment,
    DeleteByPattern,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    prefix: String,
    skip: usize,
}

#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Mutex<Vec<Fault>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail one call of `op` on a key (or pattern) starting with `prefix`,
    /// after letting `skip` matching calls through.
    pub fn fail_once(&self, op: StoreOp, prefix: impl Into<String>, skip: usize) {
        lock(&self.faults).push(Fault { op, prefix: prefix.into(), skip });
    }

    /// Faults armed but not yet triggered.
    pub fn armed(&self) -> usize {
        lock(&self.faults).len()
    }

    /// Every value written through `set` or a winning `set_if_absent`, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        lock(&self.writes).clone()
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        let Some(index) = faults.iter().position(|f| f.op == op && key.starts_with(&f.prefix)) else {
            return Ok(());
        };
        if faults[index].skip > 0 {
            faults[index].skip -= 1;
            return Ok(());
        }
        faults.remove(index);
        Err(StoreError::Sqlx(sqlx::Error::PoolTimedOut))
    }

    fn record(&self, key: &str, value: &str) {
        lock(&self.writes).push((key.to_owned(), value.to_owned()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check(StoreOp::Get, key)?;
        self.inner.get(key).await
    }

    async fn get_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check(StoreOp::GetByPattern, pattern)?;
        self.inner.get_by_pattern(pattern).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check(StoreOp::Set, key)?;
        self.inner.set(key, value).await?;
        self.record(key, value);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(Option<String>, bool), StoreError> {
        self.check(StoreOp::SetIfAbsent, key)?;
        let (previous, acquired) = self.inner.set_if_absent(key, value).await?;
        if acquired {
            self.record(key, value);
        }
        Ok((previous, acquired))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.check(StoreOp::Increment, key)?;
        self.inner.increment(key).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        self.check(StoreOp::DeleteByPattern, pattern)?;
        self.inner.delete_by_pattern(pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fault_fires_once_after_skipped_calls() {
        let store = FlakyStore::new();
        store.fail_once(StoreOp::Set, "info:", 1);

        store.set("info:a", "1").await.unwrap();
        store.set("context:a", "1").await.unwrap();
        assert!(store.set("info:b", "1").await.is_err());
        store.set("info:b", "2").await.unwrap();

        assert_eq!(store.armed(), 0);
        assert_eq!(store.get("info:b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.writes().len(), 3);
    }
}
