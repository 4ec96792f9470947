//! Simulated CPU runtime
//!
//! A deterministic stand-in for the accelerator runtime, used by tests, the
//! regression suite and machines without a device. It honors the same
//! contract as the native library:
//!
//! - base weights are read from a model file only when `read_weights` is set
//!   and stay resident across stage switches
//! - every adapter slot is a fixed-size buffer; applying writes a record into
//!   its slot, clearing zeroes the whole slot
//! - sequence length is bounded by the active stage
//!
//! The "model" is a tiny recurrent scorer. Each step mixes a fixed anchor
//! vector with the token embedding, the recurrent state and the adapter
//! contribution, then scores the vocabulary against an output table. Zeroed
//! slots contribute exactly nothing, so clearing an adapter reproduces the
//! base model bit for bit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use lorastage_core::{
    GenerationConfig, GenerationMode, SlotKey, SlotMap, SlotSelection, Stage, StageTable,
};

use crate::error::{ModelError, Result};
use crate::runtime::{LoadRequest, NativeRuntime, RuntimeError, RuntimeResult, StatusCode};

const MODEL_MAGIC: &[u8; 8] = b"LSTGMODL";
const ADAPTER_MAGIC: &[u8; 8] = b"LSTGLORA";
const FORMAT_VERSION: u32 = 1;

/// Scale of the token embedding and recurrent state relative to the anchor
const MIX: f32 = 0.25;

/// Shape and seed of a simulated model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedModelSpec {
    pub seed: u64,
    pub layer_count: u32,
    pub hidden_dim: u32,
    pub vocab_size: u32,
    /// f32 values held by each adapter slot
    pub slot_len: u32,
}

impl Default for SimulatedModelSpec {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            layer_count: 28,
            hidden_dim: 32,
            vocab_size: 1024,
            slot_len: 64,
        }
    }
}

impl SimulatedModelSpec {
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MODEL_MAGIC)?;
        writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        writer.write_u64::<LittleEndian>(self.seed)?;
        writer.write_u32::<LittleEndian>(self.layer_count)?;
        writer.write_u32::<LittleEndian>(self.hidden_dim)?;
        writer.write_u32::<LittleEndian>(self.vocab_size)?;
        writer.write_u32::<LittleEndian>(self.slot_len)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let mut cursor = Cursor::new(data.as_slice());

        let mut magic = [0u8; 8];
        cursor
            .read_exact(&mut magic)
            .map_err(|_| ModelError::InvalidFormat("model file too short".to_string()))?;
        if &magic != MODEL_MAGIC {
            return Err(ModelError::InvalidFormat("bad model magic".to_string()));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(ModelError::InvalidFormat(format!(
                "unsupported model version {}",
                version
            )));
        }

        let spec = Self {
            seed: cursor.read_u64::<LittleEndian>()?,
            layer_count: cursor.read_u32::<LittleEndian>()?,
            hidden_dim: cursor.read_u32::<LittleEndian>()?,
            vocab_size: cursor.read_u32::<LittleEndian>()?,
            slot_len: cursor.read_u32::<LittleEndian>()?,
        };
        if spec.layer_count == 0 || spec.hidden_dim == 0 || spec.vocab_size == 0 || spec.slot_len == 0
        {
            return Err(ModelError::InvalidFormat(format!("degenerate model shape {:?}", spec)));
        }
        Ok(spec)
    }
}

/// Adapter weight file: one record per (graph, region, weight) slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatedAdapter {
    pub records: BTreeMap<SlotKey, Vec<f32>>,
}

impl SimulatedAdapter {
    /// Uniform values in `[-scale, scale]` for every slot of `selection`
    pub fn generate(selection: &SlotSelection, slot_len: usize, scale: f32, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let records = selection
            .keys()
            .map(|key| {
                let values = (0..slot_len)
                    .map(|_| rng.gen_range(-1.0f32..=1.0) * scale)
                    .collect();
                (key, values)
            })
            .collect();
        Self { records }
    }

    pub fn with_record(mut self, key: SlotKey, values: Vec<f32>) -> Self {
        self.records.insert(key, values);
        self
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(ADAPTER_MAGIC)?;
        writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        writer.write_u32::<LittleEndian>(self.records.len() as u32)?;
        for (key, values) in &self.records {
            writer.write_u32::<LittleEndian>(key.graph_index)?;
            writer.write_u32::<LittleEndian>(key.region_index)?;
            writer.write_u32::<LittleEndian>(key.weight_index)?;
            writer.write_u32::<LittleEndian>(values.len() as u32)?;
            for value in values {
                writer.write_f32::<LittleEndian>(*value)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let mut cursor = Cursor::new(&mmap[..]);

        let mut magic = [0u8; 8];
        cursor
            .read_exact(&mut magic)
            .map_err(|_| ModelError::InvalidFormat("adapter file too short".to_string()))?;
        if &magic != ADAPTER_MAGIC {
            return Err(ModelError::InvalidFormat("bad adapter magic".to_string()));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(ModelError::InvalidFormat(format!(
                "unsupported adapter version {}",
                version
            )));
        }

        let count = cursor.read_u32::<LittleEndian>()?;
        let mut records = BTreeMap::new();
        for _ in 0..count {
            let key = SlotKey {
                graph_index: cursor.read_u32::<LittleEndian>()?,
                region_index: cursor.read_u32::<LittleEndian>()?,
                weight_index: cursor.read_u32::<LittleEndian>()?,
            };
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let remaining = mmap.len() as u64 - cursor.position();
            if (len as u64) * 4 > remaining {
                return Err(ModelError::InvalidFormat(format!(
                    "record {:?} claims {} values, {} bytes left",
                    key, len, remaining
                )));
            }
            let mut values = vec![0.0f32; len];
            cursor.read_f32_into::<LittleEndian>(&mut values)?;
            records.insert(key, values);
        }

        Ok(Self { records })
    }
}

/// Call counters, for asserting on how a session drove the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    /// Model file reads
    pub weight_reads: usize,
    pub inits: usize,
    pub updates: usize,
    pub zeros: usize,
    pub prefills: usize,
    pub decode_steps: usize,
    pub deinits: usize,
}

/// Resident model state; survives `init(read_weights = false)`
struct DeviceState {
    spec: SimulatedModelSpec,
    model_path: PathBuf,
    anchor: Vec<f32>,
    embeddings: Vec<f32>,
    output: Vec<f32>,
    slots: BTreeMap<SlotKey, Vec<f32>>,
    layer_keys: BTreeSet<SlotKey>,
    /// Adapter contribution from layer slots
    layer_delta: Vec<f32>,
    /// Adapter contribution from embedding slots
    embedding_delta: Vec<f32>,
}

impl DeviceState {
    fn load(model_path: &Path) -> Result<Self> {
        let spec = SimulatedModelSpec::read(model_path)?;
        let hidden = spec.hidden_dim as usize;
        let vocab = spec.vocab_size as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);

        let anchor = (0..hidden)
            .map(|_| if rng.gen::<bool>() { 1.0 } else { -1.0 })
            .collect();
        let embeddings = (0..vocab * hidden)
            .map(|_| rng.gen_range(-1.0f32..=1.0))
            .collect();
        let output = (0..vocab * hidden)
            .map(|_| rng.gen_range(-1.0f32..=1.0))
            .collect();

        let map = SlotMap::build(spec.layer_count as i64)?;
        let slot_len = spec.slot_len as usize;
        let layer_keys: BTreeSet<SlotKey> = map.layers().iter().flat_map(|a| a.keys()).collect();
        let slots = layer_keys
            .iter()
            .copied()
            .chain(map.embedding().keys())
            .map(|key| (key, vec![0.0f32; slot_len]))
            .collect();

        Ok(Self {
            model_path: model_path.to_path_buf(),
            anchor,
            embeddings,
            output,
            slots,
            layer_keys,
            layer_delta: vec![0.0; hidden],
            embedding_delta: vec![0.0; hidden],
            spec,
        })
    }

    fn hidden(&self) -> usize {
        self.spec.hidden_dim as usize
    }

    /// Fold every slot into the two per-step deltas
    fn refresh_deltas(&mut self) {
        let hidden = self.hidden();
        let mut layer = vec![0.0f32; hidden];
        let mut embedding = vec![0.0f32; hidden];
        let mut layer_count = 0usize;
        let mut embedding_count = 0usize;

        for (key, values) in &self.slots {
            let (target, count) = if self.layer_keys.contains(key) {
                (&mut layer, &mut layer_count)
            } else {
                (&mut embedding, &mut embedding_count)
            };
            *count += 1;
            for (i, v) in values.iter().enumerate() {
                target[i % hidden] += v;
            }
        }

        let layer_norm = (layer_count.max(1) as f32).sqrt();
        let embedding_norm = (embedding_count.max(1) as f32).sqrt();
        self.layer_delta = layer.into_iter().map(|v| v / layer_norm).collect();
        self.embedding_delta = embedding.into_iter().map(|v| v / embedding_norm).collect();
    }

    fn check_model(&self, model_path: &Path) -> RuntimeResult<()> {
        if model_path != self.model_path {
            return Err(RuntimeError::new(
                StatusCode::WeightLoad,
                format!(
                    "slots belong to {}, not {}",
                    self.model_path.display(),
                    model_path.display()
                ),
            ));
        }
        Ok(())
    }

    fn check_addresses(&self, selection: &SlotSelection) -> RuntimeResult<()> {
        match selection.keys().find(|key| !self.slots.contains_key(key)) {
            Some(key) => Err(RuntimeError::new(
                StatusCode::WeightLoad,
                format!("no weight slot at {:?}", key),
            )),
            None => Ok(()),
        }
    }
}

/// CPU implementation of [`NativeRuntime`]
pub struct SimulatedRuntime {
    stages: StageTable,
    device: Option<DeviceState>,
    stage: Option<Stage>,
    recurrent: Vec<f32>,
    history: Vec<u32>,
    last_token: Option<u32>,
    total_length: usize,
    steps: usize,
    status: i32,
    rng: ChaCha8Rng,
    trace: Vec<Vec<f32>>,
    counters: RuntimeCounters,
    eos_after: Option<(u32, usize)>,
    injected: Option<StatusCode>,
}

impl SimulatedRuntime {
    /// Runtime serving the given compiled stage table
    pub fn new(stages: StageTable) -> Self {
        Self {
            stages,
            device: None,
            stage: None,
            recurrent: Vec::new(),
            history: Vec::new(),
            last_token: None,
            total_length: 0,
            steps: 0,
            status: 0,
            rng: ChaCha8Rng::seed_from_u64(0),
            trace: Vec::new(),
            counters: RuntimeCounters::default(),
            eos_after: None,
            injected: None,
        }
    }

    /// Emit `eos` once `steps` decode steps have run since the last prefill
    pub fn with_eos_after(mut self, eos: u32, steps: usize) -> Self {
        self.eos_after = Some((eos, steps));
        self
    }

    /// Make the next prefill or decode step fail with `status`
    pub fn inject_failure(&mut self, status: StatusCode) {
        self.injected = Some(status);
    }

    pub fn counters(&self) -> RuntimeCounters {
        self.counters
    }

    /// Current contents of one adapter slot
    pub fn slot(&self, key: SlotKey) -> Option<&[f32]> {
        self.device
            .as_ref()
            .and_then(|d| d.slots.get(&key))
            .map(Vec::as_slice)
    }

    pub fn active_stage(&self) -> Option<Stage> {
        self.stage
    }

    fn fail<T>(&mut self, err: RuntimeError) -> RuntimeResult<T> {
        self.status = err.status.code();
        Err(err)
    }

    fn loaded(&self) -> RuntimeResult<(&DeviceState, Stage)> {
        match (&self.device, self.stage) {
            (Some(device), Some(stage)) => Ok((device, stage)),
            _ => Err(RuntimeError::new(
                StatusCode::RuntimeContext,
                "runtime is not initialized",
            )),
        }
    }

    fn take_injected(&mut self) -> RuntimeResult<()> {
        match self.injected.take() {
            Some(status) => self.fail(RuntimeError::new(status, "injected failure")),
            None => Ok(()),
        }
    }

    /// Advance the recurrent state by one token and return the hidden vector
    fn step(&mut self, token: u32) -> RuntimeResult<Vec<f32>> {
        let (device, _) = self.loaded()?;
        let hidden = device.hidden();
        let row = (token % device.spec.vocab_size) as usize * hidden;
        let embedding = &device.embeddings[row..row + hidden];

        let h: Vec<f32> = (0..hidden)
            .map(|j| {
                device.anchor[j]
                    + MIX * (embedding[j] + device.embedding_delta[j])
                    + MIX * self.recurrent[j]
                    + device.layer_delta[j]
            })
            .collect();
        self.recurrent = h.iter().map(|v| v.tanh()).collect();
        Ok(h)
    }

    fn logits(&self, h: &[f32]) -> RuntimeResult<Vec<f32>> {
        let (device, _) = self.loaded()?;
        let hidden = device.hidden();
        Ok(device
            .output
            .chunks_exact(hidden)
            .map(|row| row.iter().zip(h).map(|(a, b)| a * b).sum())
            .collect())
    }

    fn choose(&mut self, h: &[f32], generation: &GenerationConfig) -> RuntimeResult<u32> {
        let mut logits = self.logits(h)?;
        let token = match generation.mode {
            GenerationMode::Greedy => argmax(&logits),
            GenerationMode::PenaltySample => {
                let start = self.history.len().saturating_sub(generation.repeat_last_n);
                let recent: BTreeSet<u32> = self.history[start..].iter().copied().collect();
                apply_repeat_penalty(&mut logits, &recent, generation.repeat_penalty);
                sample_top_p(&logits, generation, &mut self.rng)
            }
        };
        Ok(token)
    }
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best as u32
}

fn apply_repeat_penalty(logits: &mut [f32], recent: &BTreeSet<u32>, penalty: f32) {
    for &token in recent {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

fn sample_top_p(logits: &[f32], generation: &GenerationConfig, rng: &mut ChaCha8Rng) -> u32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max) / generation.temperature).exp())
        .collect();
    let sum: f32 = weights.iter().sum();

    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));

    let mut cumulative = 0.0;
    let mut cut = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += weights[i] / sum;
        if cumulative >= generation.top_p {
            cut = rank + 1;
            break;
        }
    }
    let kept = &order[..cut];
    let kept_sum: f32 = kept.iter().map(|&i| weights[i]).sum();

    let target = rng.gen::<f32>() * kept_sum;
    let mut acc = 0.0;
    for &i in kept {
        acc += weights[i];
        if target < acc {
            return i as u32;
        }
    }
    kept.last().copied().unwrap_or(0) as u32
}

impl NativeRuntime for SimulatedRuntime {
    fn init(&mut self, request: &LoadRequest) -> RuntimeResult<()> {
        if request.devices.is_empty() {
            return self.fail(RuntimeError::new(StatusCode::HandleCreation, "no devices given"));
        }
        let stage = match self.stages.stage(request.stage_index as i64) {
            Ok(stage) => stage,
            Err(e) => return self.fail(RuntimeError::new(StatusCode::RuntimeContext, e.to_string())),
        };

        if request.read_weights {
            let device = match DeviceState::load(&request.model_path) {
                Ok(device) => device,
                Err(e) => return self.fail(RuntimeError::new(StatusCode::WeightLoad, e.to_string())),
            };
            self.device = Some(device);
            self.counters.weight_reads += 1;
        } else if self.device.is_none() {
            return self.fail(RuntimeError::new(
                StatusCode::WeightLoad,
                "no resident weights to reuse",
            ));
        }

        self.stage = Some(stage);
        self.recurrent.clear();
        self.history.clear();
        self.last_token = None;
        self.total_length = 0;
        self.counters.inits += 1;
        self.status = 0;
        Ok(())
    }

    fn update_weights(
        &mut self,
        model_path: &Path,
        adapter_path: &Path,
        selection: &SlotSelection,
    ) -> RuntimeResult<()> {
        // same text form the native call receives
        let selection = match selection.to_wire().parse() {
            Ok(selection) => selection,
            Err(e) => return self.fail(RuntimeError::new(StatusCode::WeightLoad, e.to_string())),
        };
        let adapter = match SimulatedAdapter::read(adapter_path) {
            Ok(adapter) => adapter,
            Err(e) => return self.fail(RuntimeError::new(StatusCode::WeightLoad, e.to_string())),
        };

        let checked = self.loaded().and_then(|(device, _)| {
            device.check_model(model_path)?;
            device.check_addresses(&selection)?;
            for key in selection.keys() {
                let capacity = device.slots.get(&key).map_or(0, Vec::len);
                match adapter.records.get(&key) {
                    None => {
                        return Err(RuntimeError::new(
                            StatusCode::WeightLoad,
                            format!("adapter has no record for {:?}", key),
                        ))
                    }
                    Some(values) if values.len() > capacity => {
                        return Err(RuntimeError::new(
                            StatusCode::WeightLoad,
                            format!(
                                "record {:?} holds {} values, slot holds {}",
                                key,
                                values.len(),
                                capacity
                            ),
                        ))
                    }
                    Some(_) => {}
                }
            }
            Ok(())
        });
        if let Err(e) = checked {
            return self.fail(e);
        }

        if let Some(device) = self.device.as_mut() {
            for key in selection.keys() {
                if let (Some(slot), Some(values)) = (device.slots.get_mut(&key), adapter.records.get(&key)) {
                    slot[..values.len()].copy_from_slice(values);
                }
            }
            device.refresh_deltas();
        }
        self.counters.updates += 1;
        self.status = 0;
        Ok(())
    }

    fn zero_weights(&mut self, model_path: &Path, selection: &SlotSelection) -> RuntimeResult<()> {
        let checked = self.loaded().and_then(|(device, _)| {
            device.check_model(model_path)?;
            device.check_addresses(selection)
        });
        if let Err(e) = checked {
            return self.fail(e);
        }

        if let Some(device) = self.device.as_mut() {
            for key in selection.keys() {
                if let Some(slot) = device.slots.get_mut(&key) {
                    slot.fill(0.0);
                }
            }
            device.refresh_deltas();
        }
        self.counters.zeros += 1;
        self.status = 0;
        Ok(())
    }

    fn forward_first(&mut self, tokens: &[u32], generation: &GenerationConfig) -> RuntimeResult<u32> {
        let stage = match self.loaded() {
            Ok((_, stage)) => stage,
            Err(e) => return self.fail(e),
        };
        if tokens.is_empty() || tokens.len() > stage.max_prompt_length {
            return self.fail(RuntimeError::new(
                StatusCode::InvalidInputLength,
                format!(
                    "{} prompt tokens, stage {} accepts 1..={}",
                    tokens.len(),
                    stage.index,
                    stage.max_prompt_length
                ),
            ));
        }
        self.take_injected()?;

        let hidden = self.loaded()?.0.hidden();
        self.recurrent = vec![0.0; hidden];
        self.history = tokens.to_vec();
        self.trace.clear();
        self.rng = ChaCha8Rng::seed_from_u64(generation.seed);
        self.steps = 0;

        let mut h = Vec::new();
        for &token in tokens {
            h = self.step(token)?;
        }
        let token = self.choose(&h, generation)?;
        self.trace.push(h);

        self.total_length = tokens.len();
        self.last_token = Some(token);
        self.counters.prefills += 1;
        self.status = 0;
        Ok(token)
    }

    fn forward_next(&mut self, generation: &GenerationConfig) -> RuntimeResult<u32> {
        let stage = match self.loaded() {
            Ok((_, stage)) => stage,
            Err(e) => return self.fail(e),
        };
        let previous = match self.last_token {
            Some(token) => token,
            None => {
                return self.fail(RuntimeError::new(
                    StatusCode::Inference,
                    "decode step before prefill",
                ))
            }
        };
        if self.total_length >= stage.max_total_length {
            return self.fail(RuntimeError::new(
                StatusCode::InvalidInputLength,
                format!("sequence is full at {} tokens", self.total_length),
            ));
        }
        self.take_injected()?;

        let h = self.step(previous)?;
        self.history.push(previous);
        let mut token = self.choose(&h, generation)?;
        self.trace.push(h);
        self.total_length += 1;
        self.steps += 1;

        if let Some((eos, after)) = self.eos_after {
            if self.steps >= after {
                token = eos;
            }
        }

        self.last_token = Some(token);
        self.counters.decode_steps += 1;
        self.status = 0;
        Ok(token)
    }

    fn deinit(&mut self) {
        self.device = None;
        self.stage = None;
        self.last_token = None;
        self.total_length = 0;
        self.counters.deinits += 1;
    }

    fn total_length(&self) -> usize {
        self.total_length
    }

    fn sequence_length_cap(&self) -> usize {
        self.stage.map_or(0, |s| s.max_total_length)
    }

    fn status_code(&self) -> i32 {
        self.status
    }

    fn take_hidden_trace(&mut self) -> Option<Vec<Vec<f32>>> {
        Some(std::mem::take(&mut self.trace))
    }
}
