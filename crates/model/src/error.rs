//! Model error types

use std::path::PathBuf;

use lorastage_core::CoreError;
use thiserror::Error;

use crate::runtime::{RuntimeError, StatusCode};

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    // Adapter errors
    #[error("Adapter source not found: {}", .0.display())]
    AdapterSourceNotFound(PathBuf),

    #[error("Adapter apply failed (status {status}): {message}")]
    AdapterApplyFailed { status: StatusCode, message: String },

    // Session lifecycle errors
    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Model load failed (status {status}): {message}")]
    LoadFailed { status: StatusCode, message: String },

    #[error("Session is closed")]
    SessionClosed,

    // Request validation errors
    #[error("Input token sequence is empty")]
    EmptyInput,

    #[error("Input too long: {len} tokens, stage accepts at most {max}")]
    InputTooLong { len: usize, max: usize },

    #[error("Decode loop misuse: {0}")]
    DecodeState(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Invalid model file: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Native status code carried by this error, if the runtime reported one
    pub fn status_code(&self) -> Option<i32> {
        match self {
            ModelError::AdapterApplyFailed { status, .. }
            | ModelError::LoadFailed { status, .. } => Some(status.code()),
            ModelError::Runtime(e) => Some(e.status.code()),
            _ => None,
        }
    }

    /// Whether the session must be recreated before further use
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ModelError::LoadFailed { .. } | ModelError::SessionClosed)
    }

    /// Whether the caller can carry on, e.g. by decoding without an adapter
    pub fn is_recoverable(&self) -> bool {
        match self {
            ModelError::AdapterSourceNotFound(_)
            | ModelError::AdapterApplyFailed { .. }
            | ModelError::EmptyInput
            | ModelError::InputTooLong { .. } => true,
            ModelError::Core(e) => e.is_request_scoped(),
            _ => false,
        }
    }
}
