//! chainrange-storage: persistent backends for import progress.
//!
//! Backends:
//! - `MemoryProgressStore` (in `chainrange-core`): dev/testing, no persistence
//! - [`sqlite`]: SQLite via `sqlx`, one file shared by importer processes

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProgressStore;
