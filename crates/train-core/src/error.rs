//! Error types for training-state management

use thiserror::Error;

/// Result type alias using the train-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint is missing required key: {key}")]
    MissingKey { key: String },

    #[error("Checkpoint step {restored} is behind current step {current}")]
    StepRegression { current: u64, restored: u64 },

    #[error("No valid checkpoint found for recovery in {directory}")]
    NoCheckpointForRecovery { directory: String },

    // EMA errors
    #[error("EMA model is None")]
    EmaModelMissing,

    // State dict errors
    #[error("State dict mismatch at {key}: {reason}")]
    StateDictMismatch { key: String, reason: String },

    #[error("Type mismatch at {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Counter {key} = {value} exceeds the signed 64-bit range of a state dict")]
    CounterOverflow { key: String, value: u64 },

    #[error("Invalid tensor shape {shape:?} for {len} elements")]
    InvalidShape { shape: Vec<usize>, len: usize },

    // Utility errors
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Invalid slice: {message}")]
    InvalidSlice { message: String },

    #[error("Event log error in {path}: {message}")]
    EventLog { path: String, message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Task errors
    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::TaskJoin(_))
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CheckpointCorrupted { .. }
                | Error::StateDictMismatch { .. }
                | Error::TypeMismatch { .. }
                | Error::InvalidConfig { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}
