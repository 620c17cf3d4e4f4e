//! Local session store backed by SQLite.

pub mod schema;
pub mod sessions;

pub use sessions::SessionStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create db dir: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid timestamp {value:?} for session {id}")]
    Timestamp { id: String, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
