//! Cache projections and durable storage for the session engine.
//!
//! The cache and the database engines themselves are external collaborators;
//! this crate owns the traits at those seams, the SQLite-backed reference
//! stores, and the projection writer that turns session state into records.

use thiserror::Error;

mod cache;
mod history;
mod instructions;
mod projection;

pub use cache::{MemoryCache, ProjectionCache};
pub use history::{HistoryStore, SqliteHistoryStore};
pub use instructions::{InstructionStore, SqliteInstructionStore};
pub use projection::{keys, ProjectionWriter};

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by cache or durable-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(String),
}
