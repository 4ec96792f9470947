//! lorastage model - sessions, adapter hot-swap and decoding
//!
//! A [`ModelSession`] owns one native runtime handle with the base weights
//! resident in device memory. On top of it:
//! - **Stage switching** re-initializes the execution graph for a request's
//!   length without reading weights again
//! - **Adapter hot-swap** overwrites or zeroes fixed weight slots in place
//! - **Decoding** runs one prefill and then single-token steps until a stop
//!   rule fires
//!
//! [`SimulatedRuntime`] is a CPU implementation of [`NativeRuntime`] used
//! for tests and for running without an accelerator.

pub mod adapter;
pub mod decode;
pub mod error;
pub mod runtime;
pub mod session;
pub mod simulated;
pub mod tokenizer;

pub use decode::{DecodeLoop, DecodeMetrics, DecodeState, GenerationOutput, StopReason};
pub use error::{ModelError, Result};
pub use runtime::{LoadRequest, NativeRuntime, RuntimeError, RuntimeResult, StatusCode};
pub use session::{AppliedAdapter, LoadOptions, ModelSession, SessionState};
pub use simulated::{RuntimeCounters, SimulatedAdapter, SimulatedModelSpec, SimulatedRuntime};
pub use tokenizer::{ByteCodec, ChatFormat, ChatMessage, TokenCodec, Tokenizer};
