//! The `KvStore` trait — the operations the orchestration engine needs.

use async_trait::async_trait;

use crate::StoreError;

/// Shared key-value store.
///
/// Patterns are key prefixes optionally terminated by a `*` wildcard, e.g.
/// `lock:LOC-01.WG-100.R-001.*`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// All values whose key matches `pattern`, ordered by key.
    async fn get_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Unconditional upsert.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Write `value` iff `key` is absent, as a single atomic operation.
    ///
    /// Returns the value already present (if any) and whether this caller
    /// performed the write.  Among concurrent callers racing on one key
    /// exactly one observes `true`.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(Option<String>, bool), StoreError>;

    /// Atomically increment the counter under `key` (absent counts as 0)
    /// and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Delete every key matching `pattern`; returns the number removed.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// Strip the trailing wildcard from a pattern, leaving the literal prefix.
pub(crate) fn pattern_prefix(pattern: &str) -> &str {
    pattern.strip_suffix('*').unwrap_or(pattern)
}
