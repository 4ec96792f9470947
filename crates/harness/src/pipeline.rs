//! End-to-end request pipeline
//!
//! For every request: size it, pick the smallest stage that fits, switch to
//! it, bring the adapter slots into the requested state, then decode.
//! Sizing failures surface before the runtime is touched.

use std::path::PathBuf;

use lorastage_core::{total_length_for, AdapterBundle, GenerationConfig, RuntimeConfig, Stage};
use lorastage_model::{
    DecodeLoop, GenerationOutput, LoadOptions, ModelError, ModelSession, NativeRuntime, TokenCodec,
};

use crate::error::Result;
use crate::prompt::ChatPrompt;

/// Adapter wanted for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRequest {
    pub bundle: AdapterBundle,
    pub path: PathBuf,
}

/// One generation request
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// `None` decodes with the base model
    pub adapter: Option<AdapterRequest>,
    pub generation: GenerationConfig,
}

impl GenerationRequest {
    pub fn new(generation: GenerationConfig) -> Self {
        Self {
            adapter: None,
            generation,
        }
    }

    pub fn with_adapter(mut self, bundle: AdapterBundle, path: impl Into<PathBuf>) -> Self {
        self.adapter = Some(AdapterRequest {
            bundle,
            path: path.into(),
        });
        self
    }
}

/// Session plus codec, driven request by request
pub struct LoraPipeline<R: NativeRuntime> {
    session: ModelSession<R>,
    codec: Box<dyn TokenCodec>,
    prompt: ChatPrompt,
}

impl<R: NativeRuntime> LoraPipeline<R> {
    /// Build stage table and slot map from `config` and cold-load the model
    pub fn new(runtime: R, config: &RuntimeConfig, codec: Box<dyn TokenCodec>) -> Result<Self> {
        config.validate()?;
        let stages = config.stages.to_table()?;
        let slots = config.slots.to_map()?;
        let session = ModelSession::load(runtime, LoadOptions::from_config(config), stages, slots)?;

        Ok(Self {
            session,
            codec,
            prompt: ChatPrompt::default(),
        })
    }

    pub fn with_prompt(mut self, prompt: ChatPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Stage a request of this size would run on
    pub fn plan(&self, prompt_length: usize, generation: &GenerationConfig) -> Result<Stage> {
        let total_length = total_length_for(prompt_length, generation.max_new_tokens)?;
        Ok(self.session.stage_table().select(total_length, prompt_length)?)
    }

    /// Run one request over already-encoded prompt tokens
    pub fn generate(
        &mut self,
        prompt_tokens: &[u32],
        request: &GenerationRequest,
    ) -> Result<GenerationOutput> {
        self.generate_streaming(prompt_tokens, request, |_| {})
    }

    /// Like [`generate`](Self::generate), calling `on_token` per emitted token
    pub fn generate_streaming(
        &mut self,
        prompt_tokens: &[u32],
        request: &GenerationRequest,
        on_token: impl FnMut(u32),
    ) -> Result<GenerationOutput> {
        if prompt_tokens.is_empty() {
            return Err(ModelError::EmptyInput.into());
        }
        request.generation.validate()?;

        let stage = self.plan(prompt_tokens.len(), &request.generation)?;
        self.session.switch_stage(stage.index as i64)?;
        self.sync_adapter(request.adapter.as_ref())?;

        let eos = self.codec.eos_token_id();
        let output = DecodeLoop::new(&mut self.session, request.generation.clone(), eos)?
            .run(prompt_tokens, on_token)?;
        Ok(output)
    }

    /// Render `question` with the chat template, generate, decode to text
    pub fn chat(&mut self, question: &str, request: &GenerationRequest) -> Result<(String, GenerationOutput)> {
        let tokens = self.codec.encode(&self.prompt.render(question))?;
        let output = self.generate(&tokens, request)?;
        let text = output.text(self.codec.as_ref())?;
        Ok((text, output))
    }

    /// Bring the adapter slots to the requested state
    fn sync_adapter(&mut self, wanted: Option<&AdapterRequest>) -> Result<()> {
        let current = self
            .session
            .applied_adapter()
            .map(|a| (a.bundle, a.source.clone()));
        let target = wanted.map(|a| (a.bundle, a.path.clone()));
        if current == target {
            return Ok(());
        }

        self.session
            .swap_adapter(wanted.map(|a| (a.bundle, a.path.as_path())))?;
        Ok(())
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.codec.encode(text)?)
    }

    pub fn prompt(&self) -> &ChatPrompt {
        &self.prompt
    }

    pub fn codec(&self) -> &dyn TokenCodec {
        self.codec.as_ref()
    }

    pub fn session(&self) -> &ModelSession<R> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ModelSession<R> {
        &mut self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorastage_core::CoreError;
    use lorastage_model::{ByteCodec, SimulatedModelSpec, SimulatedRuntime};

    fn pipeline(dir: &std::path::Path) -> LoraPipeline<SimulatedRuntime> {
        let config = RuntimeConfig {
            model_path: dir.join("model.bin"),
            ..RuntimeConfig::default()
        };
        SimulatedModelSpec::default().write(&config.model_path).unwrap();
        let runtime = SimulatedRuntime::new(config.stages.to_table().unwrap());
        LoraPipeline::new(runtime, &config, Box::new(ByteCodec::default())).unwrap()
    }

    #[test]
    fn test_generate_picks_fitting_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());

        let output = pipeline
            .generate(&[1, 2, 3], &GenerationRequest::new(GenerationConfig::greedy(20)))
            .unwrap();
        assert_eq!(output.stage.max_total_length, 1024);
        assert_eq!(output.token_ids.len(), 20);

        let prompt = vec![9u32; 2500];
        let output = pipeline
            .generate(&prompt, &GenerationRequest::new(GenerationConfig::greedy(8)))
            .unwrap();
        assert_eq!(output.stage.max_total_length, 3072);
        assert_eq!(pipeline.session().weight_reads(), 1);
    }

    #[test]
    fn test_oversized_request_never_reaches_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let before = pipeline.session().runtime().counters();

        let prompt = vec![9u32; 9000];
        let err = pipeline
            .generate(&prompt, &GenerationRequest::new(GenerationConfig::greedy(20)))
            .unwrap_err();
        assert!(matches!(
            err.core_error(),
            Some(CoreError::CapacityExceeded {
                total_length: 9020,
                prompt_length: 9000
            })
        ));
        assert_eq!(pipeline.session().runtime().counters(), before);
    }

    #[test]
    fn test_chat_decodes_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());

        let (text, output) = pipeline
            .chat("hello", &GenerationRequest::new(GenerationConfig::greedy(4)))
            .unwrap();
        assert_eq!(output.token_ids.len(), 4);
        assert!(!text.is_empty());
        assert_eq!(output.metrics.prompt_tokens, pipeline.encode(&pipeline.prompt().render("hello")).unwrap().len());
    }
}
