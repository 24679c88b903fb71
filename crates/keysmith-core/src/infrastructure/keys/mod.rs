//! Key record persistence
//!
//! Provides the SQLite store used in production and an in-memory store for
//! tests.

pub mod sqlite_record_store;

pub use sqlite_record_store::{InMemoryKeyRecordStore, SqliteKeyRecordStore};
