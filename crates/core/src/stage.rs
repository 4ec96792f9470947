//! Stage tables and stage selection
//!
//! A compiled model ships several execution graphs ("stages"), each bound to
//! a maximum total sequence length and a maximum prompt length. The two
//! capacity tables are parallel and paired by position: callers must keep
//! their declared order when adding capacities.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Total-length capacities of the reference stage table
pub const REFERENCE_TOTAL_LENGTHS: [usize; 9] =
    [10240, 8192, 7168, 6144, 5120, 4096, 3072, 2048, 1024];

/// Prompt-length capacities of the reference stage table
pub const REFERENCE_PROMPT_LENGTHS: [usize; 9] =
    [8320, 8192, 7168, 6144, 5120, 4096, 3072, 2048, 1024];

/// A precompiled execution graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the compiled stage table
    pub index: usize,
    /// Maximum prompt + generated tokens
    pub max_total_length: usize,
    /// Maximum prompt tokens for prefill
    pub max_prompt_length: usize,
}

impl Stage {
    /// Whether this stage can serve a request of the given lengths
    pub fn fits(&self, total_length: usize, prompt_length: usize) -> bool {
        self.max_total_length >= total_length && self.max_prompt_length >= prompt_length
    }
}

/// Tie-break among qualifying stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Smallest qualifying stage by (total, prompt, index)
    #[default]
    Smallest,
    /// First qualifying stage in declared order
    FirstDeclared,
}

/// Ordered table of compiled stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTable {
    stages: Vec<Stage>,
    policy: SelectionPolicy,
}

impl StageTable {
    /// Build a table from parallel capacity lists
    pub fn new(total_lengths: &[usize], prompt_lengths: &[usize]) -> Result<Self> {
        if total_lengths.len() != prompt_lengths.len() {
            return Err(CoreError::InvalidStageTable(format!(
                "capacity tables differ in length: {} total vs {} prompt",
                total_lengths.len(),
                prompt_lengths.len()
            )));
        }
        if total_lengths.is_empty() {
            return Err(CoreError::InvalidStageTable(
                "at least one stage is required".to_string(),
            ));
        }

        let stages = total_lengths
            .iter()
            .zip(prompt_lengths)
            .enumerate()
            .map(|(index, (&max_total_length, &max_prompt_length))| {
                if max_total_length == 0 || max_prompt_length == 0 {
                    return Err(CoreError::InvalidStageTable(format!(
                        "stage {index} has a zero capacity"
                    )));
                }
                Ok(Stage {
                    index,
                    max_total_length,
                    max_prompt_length,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            stages,
            policy: SelectionPolicy::default(),
        })
    }

    /// The nine-stage reference table
    pub fn reference() -> Self {
        let stages = REFERENCE_TOTAL_LENGTHS
            .iter()
            .zip(REFERENCE_PROMPT_LENGTHS.iter())
            .enumerate()
            .map(|(index, (&max_total_length, &max_prompt_length))| Stage {
                index,
                max_total_length,
                max_prompt_length,
            })
            .collect();

        Self {
            stages,
            policy: SelectionPolicy::default(),
        }
    }

    /// Set the tie-break policy
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Look up a stage by explicit index.
    ///
    /// Accepts a signed index so that negative overrides are rejected
    /// instead of wrapping.
    pub fn stage(&self, index: i64) -> Result<Stage> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.stages.get(i).copied())
            .ok_or(CoreError::InvalidStage {
                index,
                stage_count: self.stages.len(),
            })
    }

    /// All stages that fit the request, in declared order
    pub fn qualifying(&self, total_length: usize, prompt_length: usize) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|s| s.fits(total_length, prompt_length))
            .copied()
            .collect()
    }

    /// Pick the stage for a request according to the table's policy
    pub fn select(&self, total_length: usize, prompt_length: usize) -> Result<Stage> {
        let candidates = self.stages.iter().filter(|s| s.fits(total_length, prompt_length));

        let chosen = match self.policy {
            SelectionPolicy::Smallest => candidates
                .min_by_key(|s| (s.max_total_length, s.max_prompt_length, s.index))
                .copied(),
            SelectionPolicy::FirstDeclared => candidates.copied().next(),
        };

        match chosen {
            Some(stage) => {
                tracing::debug!(
                    "Selected stage {} (total {}, prompt {}) for request total={} prompt={}",
                    stage.index,
                    stage.max_total_length,
                    stage.max_prompt_length,
                    total_length,
                    prompt_length
                );
                Ok(stage)
            }
            None => Err(CoreError::CapacityExceeded {
                total_length,
                prompt_length,
            }),
        }
    }

    /// Largest prompt any stage accepts
    pub fn max_prompt_length(&self) -> usize {
        self.stages.iter().map(|s| s.max_prompt_length).max().unwrap_or(0)
    }

    /// Largest total length any stage accepts
    pub fn max_total_length(&self) -> usize {
        self.stages.iter().map(|s| s.max_total_length).max().unwrap_or(0)
    }
}

/// Total sequence length of a request: prompt plus requested new tokens
pub fn total_length_for(prompt_length: usize, max_new_tokens: usize) -> Result<usize> {
    prompt_length.checked_add(max_new_tokens).ok_or(CoreError::CapacityExceeded {
        total_length: usize::MAX,
        prompt_length,
    })
}
