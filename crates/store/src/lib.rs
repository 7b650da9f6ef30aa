//! SQLite-backed strategy repository. Every lifecycle transition commits
//! atomically with its audit-log row.

mod strategies;

pub use strategies::SqliteStrategyStore;
