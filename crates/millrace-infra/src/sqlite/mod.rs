//! SQLite storage layer.
//!
//! Run, step, suspension and wait storage backed by SQLite with WAL mode and
//! split read/write connection pools.

pub mod pool;
pub mod run;

pub use pool::DatabasePool;
pub use run::SqliteRunRepository;
