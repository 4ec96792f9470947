//! Core error types

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by stage selection, slot mapping and configuration
#[derive(Debug, Error)]
pub enum CoreError {
    // Stage errors
    #[error("No compiled stage fits the request: total length {total_length}, prompt length {prompt_length}")]
    CapacityExceeded {
        total_length: usize,
        prompt_length: usize,
    },

    #[error("Invalid stage index {index}: compiled table has {stage_count} stages")]
    InvalidStage { index: i64, stage_count: usize },

    #[error("Invalid stage table: {0}")]
    InvalidStageTable(String),

    // Slot errors
    #[error("Invalid adapter layer count: {0}")]
    InvalidLayerCount(i64),

    #[error("Invalid slot layout: {0}")]
    InvalidSlotLayout(String),

    #[error("Invalid wire indices: {0}")]
    InvalidWireIndices(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the error only rejects the current request.
    ///
    /// Stage errors never touch session state, so the caller can keep
    /// serving other requests on the same session.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            CoreError::CapacityExceeded { .. } | CoreError::InvalidStage { .. }
        )
    }
}
