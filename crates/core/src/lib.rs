//! lorastage core - stage tables, adapter slot maps and configuration
//!
//! This crate holds the pure data side of staged LoRA inference:
//! - **Stage selection**: pick the smallest precompiled execution graph whose
//!   prompt and total capacities fit a request
//! - **Slot mapping**: translate adapter layers into the runtime's
//!   (graph, region, weight) addressing triple
//! - **Configuration**: TOML file + environment overrides, replacing the
//!   per-process mutable fields of the runtime handle
//!
//! Nothing here talks to a device; see `lorastage-model` for the session
//! and decode loop built on top.

pub mod config;
pub mod error;
pub mod slot;
pub mod stage;

pub use config::{
    parse_devices, GenerationConfig, GenerationMode, RuntimeConfig, SlotConfig, StageConfig,
};
pub use error::{CoreError, Result};
pub use slot::{
    AdapterBundle, SlotAddress, SlotKey, SlotLayout, SlotMap, SlotSelection, WireIndices,
    REFERENCE_LAYER_COUNT,
};
pub use stage::{total_length_for, SelectionPolicy, Stage, StageTable};
