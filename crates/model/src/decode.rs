//! Autoregressive decode loop
//!
//! One prefill call consumes the whole prompt and yields the first token;
//! each decode step appends the pending token to the output and asks the
//! runtime for the next one. Stop rules:
//!
//! - **Explicit budget** (`max_new_tokens > 0`): exactly that many tokens are
//!   emitted, EOS is not checked.
//! - **Natural stop** (`max_new_tokens == 0`): stop when the pending token is
//!   EOS. EOS is never appended.
//!
//! Under both rules decoding stops once the sequence fills the active
//! stage's total-length capacity.

use std::time::{Duration, Instant};

use lorastage_core::{GenerationConfig, Stage};

use crate::error::{ModelError, Result};
use crate::runtime::NativeRuntime;
use crate::session::ModelSession;
use crate::tokenizer::TokenCodec;

/// Where a decode loop is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Prefilling,
    Decoding,
    Done,
    Failed,
}

/// Why generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The explicit token budget was reached
    MaxTokens,
    /// The model produced EOS
    Eos,
    /// The sequence filled the stage's total-length capacity
    Capacity,
}

/// Timing of one generation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeMetrics {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub decode_steps: usize,
    /// Prefill wall time
    pub first_token_latency: Duration,
    /// Wall time spent in decode steps
    pub decode_time: Duration,
}

impl DecodeMetrics {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.decode_time.as_secs_f64();
        if secs > 0.0 {
            self.decode_steps as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of a completed generation
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub token_ids: Vec<u32>,
    pub stop_reason: StopReason,
    pub stage: Stage,
    pub metrics: DecodeMetrics,
    /// Per-step hidden states, when the runtime dumps them
    pub hidden_trace: Option<Vec<Vec<f32>>>,
}

impl GenerationOutput {
    pub fn text(&self, codec: &dyn TokenCodec) -> Result<String> {
        codec.decode(&self.token_ids)
    }
}

/// Drives prefill and decode steps against a loaded session.
///
/// Holds the session mutably, so nothing else can touch it while a
/// generation is in flight.
pub struct DecodeLoop<'a, R: NativeRuntime> {
    session: &'a mut ModelSession<R>,
    generation: GenerationConfig,
    eos_token_id: u32,
    stage: Stage,
    state: DecodeState,
    pending: Option<u32>,
    tokens: Vec<u32>,
    metrics: DecodeMetrics,
}

impl<'a, R: NativeRuntime> DecodeLoop<'a, R> {
    pub fn new(
        session: &'a mut ModelSession<R>,
        generation: GenerationConfig,
        eos_token_id: u32,
    ) -> Result<Self> {
        let stage = session.stage()?;
        generation.validate()?;
        Ok(Self {
            session,
            generation,
            eos_token_id,
            stage,
            state: DecodeState::Idle,
            pending: None,
            tokens: Vec::new(),
            metrics: DecodeMetrics::default(),
        })
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Tokens emitted so far
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Token produced by the last runtime call and not yet emitted
    pub fn pending(&self) -> Option<u32> {
        self.pending
    }

    /// Consume the whole prompt and return the first generated token
    pub fn prefill(&mut self, prompt: &[u32]) -> Result<u32> {
        if self.state != DecodeState::Idle {
            return Err(ModelError::DecodeState(format!(
                "prefill called in state {:?}",
                self.state
            )));
        }
        if prompt.is_empty() {
            self.state = DecodeState::Failed;
            return Err(ModelError::EmptyInput);
        }
        if prompt.len() > self.stage.max_prompt_length {
            self.state = DecodeState::Failed;
            return Err(ModelError::InputTooLong {
                len: prompt.len(),
                max: self.stage.max_prompt_length,
            });
        }

        self.state = DecodeState::Prefilling;
        let start = Instant::now();
        let token = match self.session.runtime.forward_first(prompt, &self.generation) {
            Ok(token) => token,
            Err(e) => {
                self.state = DecodeState::Failed;
                return Err(e.into());
            }
        };

        self.metrics.prompt_tokens = prompt.len();
        self.metrics.first_token_latency = start.elapsed();
        self.pending = Some(token);
        self.state = DecodeState::Decoding;

        tracing::debug!(
            "Prefilled {} tokens on stage {} in {:.3}s",
            prompt.len(),
            self.stage.index,
            self.metrics.first_token_latency.as_secs_f64()
        );

        Ok(token)
    }

    fn at_capacity(&self) -> bool {
        self.session.runtime.total_length() >= self.stage.max_total_length
    }

    /// Whether another decode step should run
    pub fn should_continue(&self) -> bool {
        let pending = match (self.state, self.pending) {
            (DecodeState::Decoding, Some(token)) => token,
            _ => return false,
        };
        if self.at_capacity() {
            return false;
        }
        match self.generation.max_new_tokens {
            0 => pending != self.eos_token_id,
            max => self.tokens.len() < max,
        }
    }

    /// Emit the pending token and fetch the next one
    pub fn decode_next(&mut self) -> Result<u32> {
        let pending = match (self.state, self.pending) {
            (DecodeState::Decoding, Some(token)) => token,
            (state, _) => {
                return Err(ModelError::DecodeState(format!(
                    "decode step called in state {:?}",
                    state
                )))
            }
        };

        self.tokens.push(pending);
        let start = Instant::now();
        let next = match self.session.runtime.forward_next(&self.generation) {
            Ok(token) => token,
            Err(e) => {
                self.pending = None;
                self.state = DecodeState::Failed;
                return Err(e.into());
            }
        };
        self.metrics.decode_time += start.elapsed();
        self.metrics.decode_steps += 1;
        self.pending = Some(next);

        Ok(next)
    }

    /// Stop decoding and collect the output
    pub fn finish(mut self) -> Result<GenerationOutput> {
        if self.state != DecodeState::Decoding {
            return Err(ModelError::DecodeState(format!(
                "finish called in state {:?}",
                self.state
            )));
        }
        self.state = DecodeState::Done;

        let stop_reason = if self.generation.max_new_tokens > 0
            && self.tokens.len() >= self.generation.max_new_tokens
        {
            StopReason::MaxTokens
        } else if self.generation.max_new_tokens == 0 && self.pending == Some(self.eos_token_id) {
            StopReason::Eos
        } else {
            StopReason::Capacity
        };
        self.metrics.generated_tokens = self.tokens.len();

        tracing::info!(
            "Generated {} tokens on stage {} ({:?}): FTL {:.3}s, TPS {:.3} token/s",
            self.metrics.generated_tokens,
            self.stage.index,
            stop_reason,
            self.metrics.first_token_latency.as_secs_f64(),
            self.metrics.tokens_per_second()
        );

        Ok(GenerationOutput {
            token_ids: std::mem::take(&mut self.tokens),
            stop_reason,
            stage: self.stage,
            metrics: self.metrics,
            hidden_trace: self.session.runtime.take_hidden_trace(),
        })
    }

    /// Prefill, decode until a stop rule fires, and collect the output.
    ///
    /// `on_token` sees every emitted token in order, for streaming.
    pub fn run(mut self, prompt: &[u32], mut on_token: impl FnMut(u32)) -> Result<GenerationOutput> {
        self.prefill(prompt)?;
        while self.should_continue() {
            if let Some(token) = self.pending {
                on_token(token);
            }
            self.decode_next()?;
        }
        self.finish()
    }
}

impl<R: NativeRuntime> ModelSession<R> {
    /// Run one generation on the active stage
    pub fn generate(
        &mut self,
        prompt: &[u32],
        generation: &GenerationConfig,
        eos_token_id: u32,
    ) -> Result<GenerationOutput> {
        DecodeLoop::new(self, generation.clone(), eos_token_id)?.run(prompt, |_| {})
    }
}
