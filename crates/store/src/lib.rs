//! `store` crate — pure key-value persistence layer.
//!
//! Provides the [`KvStore`] contract the orchestration engine relies on, an
//! in-memory implementation for single-process use and tests, a Postgres
//! implementation shared by a fleet of workers, and a fault-injecting test
//! double in [`mock`].  No business logic lives here.

pub mod error;
pub mod keyspace;
pub mod kv;
pub mod memory;
pub mod mock;
pub mod pool;
pub mod postgres;

pub use error::StoreError;
pub use keyspace::Keypath;
pub use kv::KvStore;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use postgres::PgStore;
