//! Postgres-backed `KvStore` shared by every worker process.
//!
//! Entries live in the `kv_entries` table.  `set_if_absent` relies on
//! `INSERT … ON CONFLICT DO NOTHING`, so the primary key constraint is the
//! serialization point between competing workers.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::kv::pattern_prefix;
use crate::{KvStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Translate a store pattern into a `LIKE` expression (escape char `\`).
fn like_pattern(pattern: &str) -> String {
    let mut like = String::new();
    for c in pattern_prefix(pattern).chars() {
        if matches!(c, '%' | '_' | '\\') {
            like.push('\\');
        }
        like.push(c);
    }
    like.push('%');
    like
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn get_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let values = sqlx::query_scalar::<_, String>(
            r#"SELECT value FROM kv_entries WHERE key LIKE $1 ESCAPE '\' ORDER BY key"#,
        )
        .bind(like_pattern(pattern))
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(Option<String>, bool), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok((None, true));
        }

        let previous = self.get(key).await?;
        Ok((previous, false))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let raw = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES ($1, '1', now())
            ON CONFLICT (key) DO UPDATE
                SET value = (kv_entries.value::BIGINT + 1)::TEXT, updated_at = now()
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(_) => StoreError::NotACounter { key: key.to_owned() },
            other => StoreError::Sqlx(other),
        })?;

        raw.parse::<i64>()
            .map_err(|_| StoreError::NotACounter { key: key.to_owned() })
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let removed = sqlx::query(r#"DELETE FROM kv_entries WHERE key LIKE $1 ESCAPE '\'"#)
            .bind(like_pattern(pattern))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
