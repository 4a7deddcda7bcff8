//! Custom error types for the backup engine.

use thiserror::Error;

use crate::coordinator::Operation;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Operation conflict: {0} is already in progress")]
    OperationConflict(Operation),

    #[error("Invalid slot: {0}")]
    InvalidSlot(String),

    #[error("A restore to slot {0} is already waiting for confirmation")]
    AlreadyPending(u32),

    #[error("No restore request is waiting for confirmation")]
    NothingPending,

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("No backed-up copy of {0} in the slot chain")]
    MissingSource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported slot metadata schema version {0}")]
    UnsupportedSchema(u32),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupError {
    /// Errors the caller can act on without anything having been touched
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackupError::OperationConflict(_)
                | BackupError::InvalidSlot(_)
                | BackupError::AlreadyPending(_)
                | BackupError::NothingPending
                | BackupError::Aborted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
