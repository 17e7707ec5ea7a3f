//! In-process `KvStore` backed by an ordered map.
//!
//! All operations run under one mutex, which makes `set_if_absent` and
//! `increment` atomic across every task sharing the store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::kv::pattern_prefix;
use crate::{KvStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Every key currently held, in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn matching<'a>(
    entries: &'a BTreeMap<String, String>,
    pattern: &str,
) -> impl Iterator<Item = (&'a String, &'a String)> {
    let prefix = pattern_prefix(pattern).to_owned();
    entries
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn get_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries();
        Ok(matching(&entries, pattern).map(|(_, v)| v.clone()).collect())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(Option<String>, bool), StoreError> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(previous) => Ok((Some(previous.clone()), false)),
            None => {
                entries.insert(key.to_owned(), value.to_owned());
                Ok((None, true))
            }
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries();
        let current = match entries.get(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::NotACounter { key: key.to_owned() })?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_owned(), next.to_string());
        Ok(next)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries();
        let doomed: Vec<String> = matching(&entries, pattern).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}
