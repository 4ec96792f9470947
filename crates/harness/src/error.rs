//! Harness error types

use lorastage_core::CoreError;
use lorastage_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("{case}: cosine similarity {similarity:.4} below threshold {threshold}")]
    SimilarityBelowThreshold {
        case: String,
        similarity: f64,
        threshold: f64,
    },

    #[error("Verification failed: {message}")]
    VerificationFailed { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl HarnessError {
    /// Structural error underneath, if any
    pub fn core_error(&self) -> Option<&CoreError> {
        match self {
            HarnessError::Core(e) => Some(e),
            HarnessError::Model(ModelError::Core(e)) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
