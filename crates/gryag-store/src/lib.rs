//! Embedded SQLite store — the sole durability substrate.
//!
//! One writer connection behind a mutex, WAL journaling, FTS5 for turn text,
//! JSON-in-TEXT columns for embeddings and media. Schema bootstrap is
//! idempotent and applies forward-compatible add-column migrations.

pub mod schema;
pub mod storage;

pub use storage::Storage;
