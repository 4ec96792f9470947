//! Runtime configuration
//!
//! Everything that used to live as mutable fields on the model object
//! (sampling parameters, stage index, adapter paths) is an immutable value
//! here and is passed explicitly into each call.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::slot::{SlotLayout, SlotMap, REFERENCE_LAYER_COUNT};
use crate::stage::{
    SelectionPolicy, StageTable, REFERENCE_PROMPT_LENGTHS, REFERENCE_TOTAL_LENGTHS,
};

/// Token generation strategy used by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Greedy,
    PenaltySample,
}

impl FromStr for GenerationMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "penalty_sample" | "penalty-sample" | "sample" => Ok(Self::PenaltySample),
            other => Err(CoreError::InvalidConfig(format!("unknown generation mode: {other}"))),
        }
    }
}

/// Per-request generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Explicit token budget; 0 means stop on EOS or stage capacity
    pub max_new_tokens: usize,
    pub mode: GenerationMode,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Seed for penalty sampling
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            mode: GenerationMode::Greedy,
            temperature: 1.0,
            top_p: 1.0,
            repeat_penalty: 1.2,
            repeat_last_n: 32,
            seed: 0,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with an explicit token budget
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.repeat_penalty.is_finite() && self.repeat_penalty > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }
}

/// Compiled stage capacities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Total-length capacity per stage, in compiled order
    pub total_lengths: Vec<usize>,
    /// Prompt-length capacity per stage, paired with `total_lengths` by position
    pub prompt_lengths: Vec<usize>,
    pub policy: SelectionPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            total_lengths: REFERENCE_TOTAL_LENGTHS.to_vec(),
            prompt_lengths: REFERENCE_PROMPT_LENGTHS.to_vec(),
            policy: SelectionPolicy::Smallest,
        }
    }
}

impl StageConfig {
    pub fn to_table(&self) -> Result<StageTable> {
        Ok(StageTable::new(&self.total_lengths, &self.prompt_lengths)?.with_policy(self.policy))
    }
}

/// Adapter slot layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    /// Number of adapter-bearing layers
    pub layer_count: i64,
    pub layout: SlotLayout,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            layer_count: REFERENCE_LAYER_COUNT,
            layout: SlotLayout::default(),
        }
    }
}

impl SlotConfig {
    pub fn to_map(&self) -> Result<SlotMap> {
        SlotMap::with_layout(self.layer_count, &self.layout)
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compiled model file
    pub model_path: PathBuf,
    /// tokenizer.json, if any
    pub tokenizer_path: Option<PathBuf>,
    /// Device ids of the device group
    pub devices: Vec<i32>,
    /// Binary embedding table handed to the runtime
    pub embedding_path: Option<PathBuf>,
    /// Default adapter weight file
    pub adapter_path: Option<PathBuf>,
    pub stages: StageConfig,
    pub slots: SlotConfig,
    pub generation: GenerationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.bin"),
            tokenizer_path: None,
            devices: vec![0],
            embedding_path: None,
            adapter_path: None,
            stages: StageConfig::default(),
            slots: SlotConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Apply environment variable overrides on top of the defaults
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides on top of `self`
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `LORASTAGE_*` overrides looked up through `var`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = var("LORASTAGE_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(path) = var("LORASTAGE_TOKENIZER_PATH") {
            self.tokenizer_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("LORASTAGE_ADAPTER_PATH") {
            self.adapter_path = Some(PathBuf::from(path));
        }
        if let Some(devices) = var("LORASTAGE_DEVICES") {
            match parse_devices(&devices) {
                Ok(d) => self.devices = d,
                Err(e) => tracing::warn!("Ignoring LORASTAGE_DEVICES: {}", e),
            }
        }
        if let Some(max) = var("LORASTAGE_MAX_NEW_TOKENS") {
            match max.trim().parse::<usize>() {
                Ok(n) => self.generation.max_new_tokens = n,
                Err(e) => tracing::warn!("Ignoring LORASTAGE_MAX_NEW_TOKENS={:?}: {}", max, e),
            }
        }
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that the tables and parameters are usable
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(CoreError::InvalidConfig("at least one device is required".to_string()));
        }
        self.stages.to_table()?;
        self.slots.to_map()?;
        self.generation.validate()
    }
}

/// Parse a comma-separated device list such as `"0,1"`
pub fn parse_devices(s: &str) -> Result<Vec<i32>> {
    let devices = s
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<i32>()
                .map_err(|e| CoreError::InvalidConfig(format!("bad device id {d:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if devices.is_empty() {
        return Err(CoreError::InvalidConfig("empty device list".to_string()));
    }
    Ok(devices)
}
