//! Model session lifecycle
//!
//! A [`ModelSession`] exclusively owns one native runtime handle and tracks
//! which stage is active and which adapter bundle is applied.
//!
//! ```text
//! Unloaded --cold_load--> Loaded(stage) --switch_stage--> Loaded(stage')
//!     ^                        |
//!     +------ reload ---- Closed <--teardown--+
//! ```
//!
//! Base weights are read from storage only by `cold_load`. A stage switch
//! re-initializes the execution graph and reuses the resident weights.
//!
//! The session is not reentrant: every operation takes `&mut self`, and a
//! [`DecodeLoop`](crate::decode::DecodeLoop) borrows the session mutably for
//! its whole life, so stage switches and weight swaps cannot overlap an
//! in-flight decode. Callers sharing a session across threads must wrap it in
//! a mutex and keep one request in flight at a time.

use std::path::PathBuf;
use std::time::Instant;

use lorastage_core::{AdapterBundle, RuntimeConfig, SlotMap, Stage, StageTable};

use crate::error::{ModelError, Result};
use crate::runtime::{LoadRequest, NativeRuntime};

/// What a session needs to (re)load its model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub devices: Vec<i32>,
    pub model_path: PathBuf,
    pub embedding_path: Option<PathBuf>,
    /// Stage activated by a cold load
    pub initial_stage: i64,
}

impl LoadOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            devices: vec![0],
            model_path: model_path.into(),
            embedding_path: None,
            initial_stage: 0,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            devices: config.devices.clone(),
            model_path: config.model_path.clone(),
            embedding_path: config.embedding_path.clone(),
            initial_stage: 0,
        }
    }

    pub fn with_initial_stage(mut self, stage: i64) -> Self {
        self.initial_stage = stage;
        self
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded(Stage),
    Closed,
}

/// Adapter currently patched into the resident weights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAdapter {
    pub bundle: AdapterBundle,
    pub source: PathBuf,
}

/// Exclusively owned handle on a device-resident model
pub struct ModelSession<R: NativeRuntime> {
    pub(crate) runtime: R,
    pub(crate) options: LoadOptions,
    pub(crate) stages: StageTable,
    pub(crate) slots: SlotMap,
    pub(crate) state: SessionState,
    pub(crate) adapter: Option<AppliedAdapter>,
    weight_reads: usize,
}

impl<R: NativeRuntime> ModelSession<R> {
    /// Create an unloaded session around a runtime
    pub fn new(runtime: R, options: LoadOptions, stages: StageTable, slots: SlotMap) -> Self {
        Self {
            runtime,
            options,
            stages,
            slots,
            state: SessionState::Unloaded,
            adapter: None,
            weight_reads: 0,
        }
    }

    /// Create a session and cold-load it in one step
    pub fn load(runtime: R, options: LoadOptions, stages: StageTable, slots: SlotMap) -> Result<Self> {
        let mut session = Self::new(runtime, options, stages, slots);
        session.cold_load()?;
        Ok(session)
    }

    /// Read base weights into device memory and activate the initial stage
    pub fn cold_load(&mut self) -> Result<Stage> {
        if let SessionState::Loaded(stage) = self.state {
            return Err(ModelError::DecodeState(format!(
                "session already loaded at stage {}; tear down before reloading",
                stage.index
            )));
        }

        let stage = self.stages.stage(self.options.initial_stage)?;

        if !self.options.model_path.exists() {
            return Err(ModelError::ModelNotFound(self.options.model_path.clone()));
        }

        let request = LoadRequest {
            devices: self.options.devices.clone(),
            model_path: self.options.model_path.clone(),
            stage_index: stage.index,
            read_weights: true,
            embedding_path: self.options.embedding_path.clone(),
        };

        let start = Instant::now();
        self.runtime.init(&request).map_err(|e| ModelError::LoadFailed {
            status: e.status,
            message: e.message,
        })?;
        self.weight_reads += 1;
        self.adapter = None;
        self.state = SessionState::Loaded(stage);

        tracing::info!(
            "Loaded {} on devices {:?} at stage {} in {:.3}s",
            self.options.model_path.display(),
            self.options.devices,
            stage.index,
            start.elapsed().as_secs_f64()
        );

        Ok(stage)
    }

    /// Reconfigure the active execution graph without re-reading weights
    pub fn switch_stage(&mut self, index: i64) -> Result<Stage> {
        let current = self.stage()?;
        let target = self.stages.stage(index)?;

        if target == current {
            tracing::debug!("Stage {} already active", target.index);
            return Ok(target);
        }

        let request = LoadRequest {
            devices: self.options.devices.clone(),
            model_path: self.options.model_path.clone(),
            stage_index: target.index,
            read_weights: false,
            embedding_path: self.options.embedding_path.clone(),
        };

        let start = Instant::now();
        if let Err(e) = self.runtime.init(&request) {
            // The graph is in an unknown state; only a cold load recovers.
            tracing::warn!("Stage switch {} -> {} failed: {}", current.index, target.index, e);
            self.runtime.deinit();
            self.adapter = None;
            self.state = SessionState::Closed;
            return Err(ModelError::LoadFailed {
                status: e.status,
                message: e.message,
            });
        }
        self.state = SessionState::Loaded(target);

        tracing::info!(
            "Switched stage {} -> {} (total {}, prompt {}) in {:.3}s",
            current.index,
            target.index,
            target.max_total_length,
            target.max_prompt_length,
            start.elapsed().as_secs_f64()
        );

        Ok(target)
    }

    /// Select the smallest fitting stage for a request and switch to it
    pub fn switch_to_fit(&mut self, total_length: usize, prompt_length: usize) -> Result<Stage> {
        self.stage()?;
        let stage = self.stages.select(total_length, prompt_length)?;
        self.switch_stage(stage.index as i64)
    }

    /// Release the device-resident weights.
    ///
    /// Clears an applied adapter first. Tearing down a closed or never
    /// loaded session does nothing.
    pub fn teardown(&mut self) -> Result<()> {
        if !self.is_loaded() {
            self.state = SessionState::Closed;
            return Ok(());
        }

        let clear_result = match self.adapter.clone() {
            Some(applied) => self.clear_adapter(applied.bundle),
            None => Ok(()),
        };
        if let Err(e) = &clear_result {
            tracing::warn!("Adapter clear before teardown failed: {}", e);
        }

        self.runtime.deinit();
        self.adapter = None;
        self.state = SessionState::Closed;
        tracing::info!("Session torn down");

        clear_result
    }

    /// Tear down (if needed) and cold-load again
    pub fn reload(&mut self) -> Result<Stage> {
        if self.is_loaded() {
            if let Err(e) = self.teardown() {
                tracing::warn!("Teardown during reload reported: {}", e);
            }
        }
        self.cold_load()
    }

    /// Active stage, or `SessionClosed` when nothing is loaded
    pub fn stage(&self) -> Result<Stage> {
        match self.state {
            SessionState::Loaded(stage) => Ok(stage),
            SessionState::Unloaded | SessionState::Closed => Err(ModelError::SessionClosed),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, SessionState::Loaded(_))
    }

    pub fn applied_adapter(&self) -> Option<&AppliedAdapter> {
        self.adapter.as_ref()
    }

    /// Number of cold loads that read base weights from storage
    pub fn weight_reads(&self) -> usize {
        self.weight_reads
    }

    pub fn stage_table(&self) -> &StageTable {
        &self.stages
    }

    pub fn slot_map(&self) -> &SlotMap {
        &self.slots
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Read-only access to the runtime (counters, status code)
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Last status code reported by the runtime
    pub fn status_code(&self) -> i32 {
        self.runtime.status_code()
    }
}

impl<R: NativeRuntime> Drop for ModelSession<R> {
    fn drop(&mut self) {
        if self.is_loaded() {
            if let Err(e) = self.teardown() {
                tracing::warn!("Teardown on drop failed: {}", e);
            }
        }
    }
}

impl<R: NativeRuntime> std::fmt::Debug for ModelSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("model_path", &self.options.model_path)
            .field("state", &self.state)
            .field("adapter", &self.adapter)
            .field("weight_reads", &self.weight_reads)
            .finish()
    }
}
