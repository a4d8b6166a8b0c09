//! mf-db: persistence for ingested media.
//!
//! SQLite storage with connection pooling, embedded migrations, typed
//! models and query modules. Media records are keyed by content checksum so
//! re-ingesting the same bytes links a new source path instead of creating a
//! second record.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
