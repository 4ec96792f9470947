//! Regression fixtures: simulated model, scaled adapters, reference traces
//!
//! Layout of a fixture directory:
//!
//! ```text
//! model.bin
//! scale{a}_embedding_scale{e}_lora_weights.bin
//! scale{a}_embedding_scale{e}_reference.json
//! manifest.json
//! ```

use std::path::{Path, PathBuf};

use lorastage_core::{AdapterBundle, GenerationConfig, RuntimeConfig, SlotConfig, SlotMap};
use lorastage_model::{ByteCodec, SimulatedAdapter, SimulatedModelSpec, SimulatedRuntime, TokenCodec};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::pipeline::{GenerationRequest, LoraPipeline};
use crate::prompt::ChatPrompt;
use crate::reference::ReferenceTrace;

/// Per-layer adapter scales, paired by position with [`EMBEDDING_SCALES`]
pub const LAYER_SCALES: [f32; 6] = [0.0, 0.01, 0.0, 0.001, 0.005, 0.01];

/// Embedding adapter scales
pub const EMBEDDING_SCALES: [f32; 6] = [0.0, 0.0, 0.01, 0.001, 0.005, 0.01];

const MANIFEST: &str = "manifest.json";
const MODEL_FILE: &str = "model.bin";

pub fn case_name(layer_scale: f32, embedding_scale: f32) -> String {
    format!("scale{}_embedding_scale{}", layer_scale, embedding_scale)
}

pub fn adapter_file_name(layer_scale: f32, embedding_scale: f32) -> String {
    format!("{}_lora_weights.bin", case_name(layer_scale, embedding_scale))
}

pub fn reference_file_name(layer_scale: f32, embedding_scale: f32) -> String {
    format!("{}_reference.json", case_name(layer_scale, embedding_scale))
}

/// One scaled adapter and the trace recorded with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureCase {
    pub layer_scale: f32,
    pub embedding_scale: f32,
    pub adapter: String,
    pub reference: String,
}

impl FixtureCase {
    pub fn name(&self) -> String {
        case_name(self.layer_scale, self.embedding_scale)
    }
}

/// Contents of a fixture directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureSet {
    #[serde(skip)]
    pub dir: PathBuf,
    pub model: String,
    pub layer_count: u32,
    pub prompt_tokens: Vec<u32>,
    pub max_new_tokens: usize,
    pub cases: Vec<FixtureCase>,
}

impl FixtureSet {
    pub fn load(dir: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(dir.join(MANIFEST))?;
        let mut set: Self = serde_json::from_str(&json)?;
        set.dir = dir.to_path_buf();
        Ok(set)
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.dir.join(MANIFEST), json)?;
        Ok(())
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(&self.model)
    }

    pub fn adapter_path(&self, case: &FixtureCase) -> PathBuf {
        self.dir.join(&case.adapter)
    }

    pub fn reference(&self, case: &FixtureCase) -> Result<ReferenceTrace> {
        ReferenceTrace::load(&self.dir.join(&case.reference))
    }

    pub fn case(&self, layer_scale: f32, embedding_scale: f32) -> Result<&FixtureCase> {
        self.cases
            .iter()
            .find(|c| c.layer_scale == layer_scale && c.embedding_scale == embedding_scale)
            .ok_or_else(|| {
                HarnessError::InvalidInput(format!(
                    "no fixture for {}",
                    case_name(layer_scale, embedding_scale)
                ))
            })
    }

    /// Runtime configuration matching the fixture model
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            model_path: self.model_path(),
            slots: SlotConfig {
                layer_count: self.layer_count as i64,
                ..SlotConfig::default()
            },
            generation: GenerationConfig::greedy(self.max_new_tokens),
            ..RuntimeConfig::default()
        }
    }

    pub fn request(&self) -> GenerationRequest {
        GenerationRequest::new(GenerationConfig::greedy(self.max_new_tokens))
    }
}

/// What to generate
#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub spec: SimulatedModelSpec,
    pub prompt_tokens: Vec<u32>,
    pub max_new_tokens: usize,
    /// Seed for adapter values
    pub seed: u64,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        let prompt = ChatPrompt::default().sample();
        Self {
            spec: SimulatedModelSpec::default(),
            prompt_tokens: prompt.bytes().map(u32::from).collect(),
            max_new_tokens: 20,
            seed: 2024,
        }
    }
}

/// Write the model, one adapter per scale pair and their reference traces
pub fn write_fixtures(dir: &Path, options: &FixtureOptions) -> Result<FixtureSet> {
    if options.prompt_tokens.is_empty() {
        return Err(HarnessError::InvalidInput("fixture prompt is empty".to_string()));
    }
    std::fs::create_dir_all(dir)?;

    let mut set = FixtureSet {
        dir: dir.to_path_buf(),
        model: MODEL_FILE.to_string(),
        layer_count: options.spec.layer_count,
        prompt_tokens: options.prompt_tokens.clone(),
        max_new_tokens: options.max_new_tokens,
        cases: Vec::new(),
    };
    options.spec.write(&set.model_path())?;

    let slots = SlotMap::build(options.spec.layer_count as i64)?;
    let layer_selection = slots.select(AdapterBundle::AdapterOnly);
    let embedding_selection = slots.select(AdapterBundle::EmbeddingOnly);
    let slot_len = options.spec.slot_len as usize;

    for (i, (&layer_scale, &embedding_scale)) in LAYER_SCALES.iter().zip(EMBEDDING_SCALES.iter()).enumerate() {
        let seed = options.seed + 2 * i as u64;
        let mut adapter = SimulatedAdapter::generate(&layer_selection, slot_len, layer_scale, seed);
        adapter.records.extend(
            SimulatedAdapter::generate(&embedding_selection, slot_len, embedding_scale, seed + 1).records,
        );

        let case = FixtureCase {
            layer_scale,
            embedding_scale,
            adapter: adapter_file_name(layer_scale, embedding_scale),
            reference: reference_file_name(layer_scale, embedding_scale),
        };
        adapter.write(&set.adapter_path(&case))?;
        set.cases.push(case);
    }

    // Record each reference on a freshly loaded model
    let config = set.runtime_config();
    for case in &set.cases {
        let runtime = SimulatedRuntime::new(config.stages.to_table()?);
        let codec: Box<dyn TokenCodec> = Box::new(ByteCodec::default());
        let mut pipeline = LoraPipeline::new(runtime, &config, codec)?;
        let request = set
            .request()
            .with_adapter(AdapterBundle::AdapterAndEmbedding, set.adapter_path(case));
        let output = pipeline.generate(&set.prompt_tokens, &request)?;
        ReferenceTrace::from_output(case.name(), &output)?.save(&set.dir.join(&case.reference))?;
    }

    set.save()?;
    tracing::info!("Wrote {} fixture cases to {}", set.cases.len(), dir.display());
    Ok(set)
}
