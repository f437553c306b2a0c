//! Error plumbing (spec §7). The taxonomy itself lives in `pim_api`
//! (shared with the wire layer); this module adds the storage-specific
//! `#[from]` conversions so `?` composes across the engine the way
//! `StorageError` does in the teacher.

pub use pim_api::EngineError;

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<turso::Error> for EngineError {
    fn from(err: turso::Error) -> Self {
        EngineError::StorageError(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::StorageError(err.to_string())
    }
}
