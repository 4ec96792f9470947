//! Native runtime seam
//!
//! The accelerator runtime is an opaque collaborator: it owns the device
//! handle, the resident base weights and the compiled stages. This module
//! fixes the contract the session layer relies on and the status codes the
//! runtime reports. Status codes are passed through unmodified.

use std::fmt;
use std::path::{Path, PathBuf};

use lorastage_core::{GenerationConfig, SlotSelection};
use thiserror::Error;

/// Status codes surfaced by the native runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Input is empty or exceeds the maximum length (-1)
    InvalidInputLength,
    /// Device handle could not be created (-2)
    HandleCreation,
    /// Runtime context could not be created (-3)
    RuntimeContext,
    /// Model weights could not be loaded, e.g. wrong decryption key (-4)
    WeightLoad,
    /// Inference call failed (-5)
    Inference,
    /// Device addressing mode is misconfigured (-6)
    AddressingMode,
    /// Any other code reported by the runtime
    Other(i32),
}

impl StatusCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Self::InvalidInputLength,
            -2 => Self::HandleCreation,
            -3 => Self::RuntimeContext,
            -4 => Self::WeightLoad,
            -5 => Self::Inference,
            -6 => Self::AddressingMode,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidInputLength => -1,
            Self::HandleCreation => -2,
            Self::RuntimeContext => -3,
            Self::WeightLoad => -4,
            Self::Inference => -5,
            Self::AddressingMode => -6,
            Self::Other(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidInputLength => "input is empty or exceeds the maximum length",
            Self::HandleCreation => "cannot create device handle",
            Self::RuntimeContext => "cannot create runtime context",
            Self::WeightLoad => "cannot load model weights (is the key correct?)",
            Self::Inference => "cannot run inference",
            Self::AddressingMode => "addressing mode must be enabled",
            Self::Other(_) => "unknown runtime status",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Failure reported by the native runtime
#[derive(Debug, Clone, Error)]
#[error("runtime status {status}: {message}")]
pub struct RuntimeError {
    pub status: StatusCode,
    pub message: String,
}

impl RuntimeError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Arguments of a runtime `init` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Device group
    pub devices: Vec<i32>,
    /// Compiled model file
    pub model_path: PathBuf,
    /// Stage whose execution graph becomes active
    pub stage_index: usize,
    /// Read base weights from storage; `false` reuses resident weights
    pub read_weights: bool,
    /// Optional binary embedding table
    pub embedding_path: Option<PathBuf>,
}

/// The native accelerator runtime.
///
/// Implementations mutate device-resident memory without internal locking;
/// every method takes `&mut self` and callers must never issue two calls
/// concurrently against the same runtime.
pub trait NativeRuntime {
    /// Create the handle and activate `request.stage_index`, reading base
    /// weights only when `request.read_weights` is set
    fn init(&mut self, request: &LoadRequest) -> RuntimeResult<()>;

    /// Copy adapter data from `adapter_path` into every slot of `selection`
    fn update_weights(
        &mut self,
        model_path: &Path,
        adapter_path: &Path,
        selection: &SlotSelection,
    ) -> RuntimeResult<()>;

    /// Zero every slot of `selection`, exactly to each slot's size
    fn zero_weights(&mut self, model_path: &Path, selection: &SlotSelection) -> RuntimeResult<()>;

    /// Prefill: consume the prompt and return the first generated token
    fn forward_first(&mut self, tokens: &[u32], generation: &GenerationConfig)
        -> RuntimeResult<u32>;

    /// Incremental decode: consume the previous token and return the next
    fn forward_next(&mut self, generation: &GenerationConfig) -> RuntimeResult<u32>;

    /// Release the handle and the resident base weights
    fn deinit(&mut self);

    /// Tokens currently held in the sequence (prompt + decoded)
    fn total_length(&self) -> usize;

    /// Total-length capacity of the active stage
    fn sequence_length_cap(&self) -> usize;

    /// Last status code reported, 0 when the last call succeeded
    fn status_code(&self) -> i32;

    /// Hidden states dumped per step since the last prefill, if the runtime
    /// was built with output dumping
    fn take_hidden_trace(&mut self) -> Option<Vec<Vec<f32>>> {
        None
    }
}
