//! Adapter slot addressing
//!
//! The runtime addresses device memory by a triple of
//! (graph index, memory-region index, weight index). Every adapter-bearing
//! layer owns one graph and one region; the embedding adapter owns a single
//! extra pair placed after the last layer. The map is derived once from the
//! layer count and a [`SlotLayout`], never hard-coded per layer.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Positions of the LoRA A/B factors in every ordinary layer's weight list
/// (q/k/v/o attention projections and gate/up/down MLP projections).
pub const LAYER_LORA_WEIGHT_INDICES: [u32; 14] = [1, 2, 3, 4, 5, 6, 9, 10, 13, 14, 16, 17, 19, 20];

/// Positions of the LoRA A/B factors in the embedding adapter's weight list
pub const EMBEDDING_LORA_WEIGHT_INDICES: [u32; 2] = [0, 1];

/// Adapter-bearing layers of the reference network
pub const REFERENCE_LAYER_COUNT: i64 = 28;

/// Table describing where adapter factors live inside each graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotLayout {
    /// Weight positions shared by every ordinary layer
    pub layer_weight_indices: Vec<u32>,
    /// Weight positions of the embedding adapter
    pub embedding_weight_indices: Vec<u32>,
    /// Graphs per layer (adapter graph + base graph)
    pub graph_stride: u32,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            layer_weight_indices: LAYER_LORA_WEIGHT_INDICES.to_vec(),
            embedding_weight_indices: EMBEDDING_LORA_WEIGHT_INDICES.to_vec(),
            graph_stride: 2,
        }
    }
}

/// Runtime address of one adapter-bearing layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotAddress {
    pub graph_index: u32,
    pub region_index: u32,
    pub weight_indices: BTreeSet<u32>,
}

impl SlotAddress {
    /// Every (graph, region, weight) triple covered by this address
    pub fn keys(&self) -> impl Iterator<Item = SlotKey> + '_ {
        self.weight_indices.iter().map(move |&weight_index| SlotKey {
            graph_index: self.graph_index,
            region_index: self.region_index,
            weight_index,
        })
    }
}

/// A single addressable weight slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub graph_index: u32,
    pub region_index: u32,
    pub weight_index: u32,
}

/// Which group of adapter slots an apply/clear acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterBundle {
    /// Per-layer deltas only
    AdapterOnly,
    /// Embedding adapter only
    EmbeddingOnly,
    /// Per-layer deltas and embedding adapter
    AdapterAndEmbedding,
}

impl AdapterBundle {
    pub fn includes_layers(&self) -> bool {
        matches!(self, Self::AdapterOnly | Self::AdapterAndEmbedding)
    }

    pub fn includes_embedding(&self) -> bool {
        matches!(self, Self::EmbeddingOnly | Self::AdapterAndEmbedding)
    }

    /// Whether two bundles share any slot
    pub fn overlaps(&self, other: &AdapterBundle) -> bool {
        (self.includes_layers() && other.includes_layers())
            || (self.includes_embedding() && other.includes_embedding())
    }
}

impl fmt::Display for AdapterBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AdapterOnly => "adapter",
            Self::EmbeddingOnly => "embedding",
            Self::AdapterAndEmbedding => "adapter+embedding",
        };
        f.write_str(name)
    }
}

impl FromStr for AdapterBundle {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adapter" | "lora" | "adapter_only" => Ok(Self::AdapterOnly),
            "embedding" | "lora_embedding" | "embedding_only" => Ok(Self::EmbeddingOnly),
            "adapter+embedding" | "both" | "all" | "adapter_and_embedding" => {
                Ok(Self::AdapterAndEmbedding)
            }
            other => Err(CoreError::InvalidConfig(format!("unknown adapter bundle: {other}"))),
        }
    }
}

/// Static layer → slot address table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    layers: Vec<SlotAddress>,
    embedding: SlotAddress,
}

impl SlotMap {
    /// Build the map for `layer_count` layers with the reference layout
    pub fn build(layer_count: i64) -> Result<Self> {
        Self::with_layout(layer_count, &SlotLayout::default())
    }

    /// Build the map for `layer_count` layers with a custom layout
    pub fn with_layout(layer_count: i64, layout: &SlotLayout) -> Result<Self> {
        let layers = u32::try_from(layer_count)
            .ok()
            .filter(|&n| n > 0)
            .ok_or(CoreError::InvalidLayerCount(layer_count))?;

        if layout.layer_weight_indices.is_empty() || layout.embedding_weight_indices.is_empty() {
            return Err(CoreError::InvalidSlotLayout(
                "weight index sets must not be empty".to_string(),
            ));
        }
        if layout.graph_stride == 0 {
            return Err(CoreError::InvalidSlotLayout(
                "graph stride must be positive".to_string(),
            ));
        }
        let embedding_graph = layers.checked_mul(layout.graph_stride).ok_or_else(|| {
            CoreError::InvalidSlotLayout(format!("graph index overflow for {layers} layers"))
        })?;

        let layer_weights: BTreeSet<u32> = layout.layer_weight_indices.iter().copied().collect();
        let layer_slots = (0..layers)
            .map(|layer| SlotAddress {
                graph_index: layer * layout.graph_stride,
                region_index: layer,
                weight_indices: layer_weights.clone(),
            })
            .collect();

        let embedding = SlotAddress {
            graph_index: embedding_graph,
            region_index: layers,
            weight_indices: layout.embedding_weight_indices.iter().copied().collect(),
        };

        Ok(Self {
            layers: layer_slots,
            embedding,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Option<&SlotAddress> {
        self.layers.get(layer)
    }

    pub fn layers(&self) -> &[SlotAddress] {
        &self.layers
    }

    pub fn embedding(&self) -> &SlotAddress {
        &self.embedding
    }

    /// Resolve a bundle to the addresses it targets
    pub fn select(&self, bundle: AdapterBundle) -> SlotSelection {
        let mut slots = Vec::with_capacity(self.layers.len() + 1);
        if bundle.includes_layers() {
            slots.extend(self.layers.iter().cloned());
        }
        if bundle.includes_embedding() {
            slots.push(self.embedding.clone());
        }
        SlotSelection { slots }
    }
}

/// The set of addresses one apply/clear call targets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotSelection {
    slots: Vec<SlotAddress>,
}

impl SlotSelection {
    pub fn slots(&self) -> &[SlotAddress] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn graph_indices(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.graph_index).collect()
    }

    pub fn region_indices(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.region_index).collect()
    }

    pub fn weight_index_lists(&self) -> Vec<Vec<u32>> {
        self.slots
            .iter()
            .map(|s| s.weight_indices.iter().copied().collect())
            .collect()
    }

    /// Every individual weight slot in the selection
    pub fn keys(&self) -> impl Iterator<Item = SlotKey> + '_ {
        self.slots.iter().flat_map(|s| s.keys())
    }

    /// Text encoding used when crossing into the native runtime
    pub fn to_wire(&self) -> WireIndices {
        WireIndices {
            graph: join(self.slots.iter().map(|s| s.graph_index)),
            region: join(self.slots.iter().map(|s| s.region_index)),
            weights: self
                .slots
                .iter()
                .map(|s| join(s.weight_indices.iter().copied()))
                .collect(),
        }
    }
}

/// Comma-joined index strings, one component per argument of the native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireIndices {
    /// `"g0,g1,...,gn"`
    pub graph: String,
    /// `"r0,r1,...,rn"`
    pub region: String,
    /// One `"w0,w1,..."` string per targeted layer
    pub weights: Vec<String>,
}

impl WireIndices {
    /// Decode the text form back into a typed selection
    pub fn parse(&self) -> Result<SlotSelection> {
        let graphs = split(&self.graph)?;
        let regions = split(&self.region)?;

        if graphs.len() != regions.len() || graphs.len() != self.weights.len() {
            return Err(CoreError::InvalidWireIndices(format!(
                "component lengths differ: {} graph, {} region, {} weight lists",
                graphs.len(),
                regions.len(),
                self.weights.len()
            )));
        }

        let slots = graphs
            .into_iter()
            .zip(regions)
            .zip(&self.weights)
            .map(|((graph_index, region_index), weights)| {
                let weight_indices: BTreeSet<u32> = split(weights)?.into_iter().collect();
                if weight_indices.is_empty() {
                    return Err(CoreError::InvalidWireIndices(format!(
                        "empty weight list for graph {graph_index}"
                    )));
                }
                Ok(SlotAddress {
                    graph_index,
                    region_index,
                    weight_indices,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SlotSelection { slots })
    }
}

fn join(values: impl Iterator<Item = u32>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

fn split(text: &str) -> Result<Vec<u32>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| CoreError::InvalidWireIndices(format!("{part:?}: {e}")))
        })
        .collect()
}
