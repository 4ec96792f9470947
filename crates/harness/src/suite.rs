//! Adapter regression suite
//!
//! Every case cold-loads a fresh session, like a separate process would:
//! 1. baseline generation without adapter
//! 2. each scaled adapter against its recorded reference trace; a non-zero
//!    adapter must also move the hidden states away from the baseline
//! 3. apply, decode, clear, decode; the adapted run must differ from the
//!    baseline and the cleared run must match it bit for bit
//! 4. the same in a loop, with and without decoding between cycles
//! 5. a zero-scale adapter; must match the baseline
//! 6. a prompt longer than every stage; must be rejected up front
//! 7. stage indices -1 and 100 at load and at switch; must be rejected

use std::path::{Path, PathBuf};

use lorastage_core::{AdapterBundle, CoreError, StageTable};
use lorastage_model::{ByteCodec, LoadOptions, ModelError, ModelSession, NativeRuntime};

use crate::error::{HarnessError, Result};
use crate::fixtures::{FixtureCase, FixtureSet};
use crate::pipeline::{GenerationRequest, LoraPipeline};
use crate::reference::ReferenceTrace;

/// Suite knobs
#[derive(Debug, Clone, Copy)]
pub struct SuiteOptions {
    /// Minimum cosine similarity against a reference trace
    pub threshold: f64,
    /// Apply/clear cycles in the stress case
    pub loops: usize,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            loops: 5,
        }
    }
}

/// Outcome of one case
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseResult>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed)
    }

    /// Turn the first failure into an error
    pub fn ensure_passed(&self) -> Result<()> {
        match self.failures().next() {
            Some(case) => Err(HarnessError::VerificationFailed {
                message: format!("{}: {}", case.name, case.detail),
            }),
            None => Ok(()),
        }
    }

    fn record(&mut self, name: &str, outcome: Result<(String, Option<f64>)>) {
        let result = match outcome {
            Ok((detail, similarity)) => {
                tracing::info!("[PASS] {}: {}", name, detail);
                CaseResult {
                    name: name.to_string(),
                    passed: true,
                    detail,
                    similarity,
                }
            }
            Err(e) => {
                tracing::warn!("[FAIL] {}: {}", name, e);
                let similarity = match &e {
                    HarnessError::SimilarityBelowThreshold { similarity, .. } => Some(*similarity),
                    _ => None,
                };
                CaseResult {
                    name: name.to_string(),
                    passed: false,
                    detail: e.to_string(),
                    similarity,
                }
            }
        };
        self.cases.push(result);
    }
}

type RuntimeFactory<'a, R> = &'a mut dyn FnMut(&StageTable) -> R;

pub struct RegressionSuite {
    fixtures: FixtureSet,
    options: SuiteOptions,
}

impl RegressionSuite {
    pub fn new(fixtures: FixtureSet, options: SuiteOptions) -> Self {
        Self { fixtures, options }
    }

    /// Run every case, creating one runtime per cold load
    pub fn run<R: NativeRuntime>(
        &self,
        mut make_runtime: impl FnMut(&StageTable) -> R,
    ) -> Result<SuiteReport> {
        let make: RuntimeFactory<'_, R> = &mut make_runtime;
        let mut report = SuiteReport::default();

        let baseline = self.generate(make, None)?;
        report.record(
            "baseline",
            Ok((format!("{} tokens", baseline.token_ids.len()), None)),
        );

        for case in &self.fixtures.cases {
            let outcome = self.scaled_adapter(make, case, &baseline);
            report.record(&case.name(), outcome);
        }

        let outcome = self.apply_clear(make, &baseline);
        report.record("apply_clear", outcome);

        let outcome = self.apply_clear_loop(make, &baseline);
        report.record("apply_clear_loop", outcome);

        let outcome = self.zero_scale(make, &baseline);
        report.record("zero_scale", outcome);

        let outcome = self.abnormal_length(make);
        report.record("abnormal_length", outcome);

        let outcome = self.abnormal_stage(make);
        report.record("abnormal_stage", outcome);

        let failed = report.failures().count();
        tracing::info!(
            "Regression suite: {} passed, {} failed",
            report.cases.len() - failed,
            failed
        );
        Ok(report)
    }

    fn pipeline<R: NativeRuntime>(&self, make: RuntimeFactory<'_, R>) -> Result<LoraPipeline<R>> {
        let config = self.fixtures.runtime_config();
        let runtime = make(&config.stages.to_table()?);
        LoraPipeline::new(runtime, &config, Box::new(ByteCodec::default()))
    }

    fn decode<R: NativeRuntime>(&self, pipeline: &mut LoraPipeline<R>, name: &str) -> Result<ReferenceTrace> {
        self.decode_with(pipeline, &self.fixtures.request(), name)
    }

    fn decode_with<R: NativeRuntime>(
        &self,
        pipeline: &mut LoraPipeline<R>,
        request: &GenerationRequest,
        name: &str,
    ) -> Result<ReferenceTrace> {
        let output = pipeline.generate(&self.fixtures.prompt_tokens, request)?;
        ReferenceTrace::from_output(name, &output)
    }

    /// Fresh session, optional adapter, one generation
    fn generate<R: NativeRuntime>(
        &self,
        make: RuntimeFactory<'_, R>,
        adapter_scales: Option<(f32, f32)>,
    ) -> Result<ReferenceTrace> {
        let mut pipeline = self.pipeline(make)?;
        let mut request = self.fixtures.request();
        let name = match adapter_scales {
            Some((layer, embedding)) => {
                let case = self.fixtures.case(layer, embedding)?;
                request = request
                    .with_adapter(AdapterBundle::AdapterAndEmbedding, self.fixtures.adapter_path(case));
                case.name()
            }
            None => "baseline".to_string(),
        };
        let output = pipeline.generate(&self.fixtures.prompt_tokens, &request)?;
        ReferenceTrace::from_output(name, &output)
    }

    fn scaled_adapter<R: NativeRuntime>(
        &self,
        make: RuntimeFactory<'_, R>,
        case: &FixtureCase,
        baseline: &ReferenceTrace,
    ) -> Result<(String, Option<f64>)> {
        let reference = self.fixtures.reference(case)?;
        let actual = self.generate(make, Some((case.layer_scale, case.embedding_scale)))?;
        if case.layer_scale != 0.0 || case.embedding_scale != 0.0 {
            expect_adapted(baseline, &actual)?;
        }
        let similarity = reference.check(&actual, self.options.threshold)?;
        Ok((format!("cos_sim {:.6}", similarity), Some(similarity)))
    }

    fn stress_adapter(&self) -> Result<PathBuf> {
        Ok(self.fixtures.adapter_path(self.fixtures.case(0.005, 0.005)?))
    }

    /// Apply the stress adapter, decode with it, clear it
    fn adapted_cycle<R: NativeRuntime>(
        &self,
        pipeline: &mut LoraPipeline<R>,
        adapter: &Path,
        baseline: &ReferenceTrace,
        name: &str,
    ) -> Result<()> {
        pipeline
            .session_mut()
            .apply_adapter(AdapterBundle::AdapterAndEmbedding, adapter)?;
        let request = self
            .fixtures
            .request()
            .with_adapter(AdapterBundle::AdapterAndEmbedding, adapter);
        let adapted = self.decode_with(pipeline, &request, name)?;
        expect_adapted(baseline, &adapted)?;
        pipeline
            .session_mut()
            .clear_adapter(AdapterBundle::AdapterAndEmbedding)?;
        Ok(())
    }

    fn apply_clear<R: NativeRuntime>(
        &self,
        make: RuntimeFactory<'_, R>,
        baseline: &ReferenceTrace,
    ) -> Result<(String, Option<f64>)> {
        let adapter = self.stress_adapter()?;
        let mut pipeline = self.pipeline(make)?;

        self.adapted_cycle(&mut pipeline, &adapter, baseline, "apply")?;
        let actual = self.decode(&mut pipeline, "apply_clear")?;
        expect_identical(baseline, &actual)?;

        // no decode while the adapter is resident
        let session = pipeline.session_mut();
        session.apply_adapter(AdapterBundle::AdapterAndEmbedding, &adapter)?;
        session.clear_adapter(AdapterBundle::AdapterAndEmbedding)?;
        let actual = self.decode(&mut pipeline, "apply_clear_undecoded")?;
        expect_identical(baseline, &actual)?;

        Ok(("decode matches baseline".to_string(), Some(baseline.similarity(&actual)?)))
    }

    fn apply_clear_loop<R: NativeRuntime>(
        &self,
        make: RuntimeFactory<'_, R>,
        baseline: &ReferenceTrace,
    ) -> Result<(String, Option<f64>)> {
        let adapter = self.stress_adapter()?;
        let mut pipeline = self.pipeline(make)?;

        for i in 0..self.options.loops {
            self.adapted_cycle(&mut pipeline, &adapter, baseline, &format!("loop{}_adapted", i))?;
            let actual = self.decode(&mut pipeline, &format!("loop{}", i))?;
            expect_identical(baseline, &actual)?;
        }

        for _ in 0..self.options.loops {
            let session = pipeline.session_mut();
            session.apply_adapter(AdapterBundle::AdapterAndEmbedding, &adapter)?;
            session.clear_adapter(AdapterBundle::AdapterAndEmbedding)?;
        }
        let actual = self.decode(&mut pipeline, "loop_final")?;
        expect_identical(baseline, &actual)?;

        Ok((format!("{} cycles match baseline", 2 * self.options.loops), None))
    }

    fn zero_scale<R: NativeRuntime>(
        &self,
        make: RuntimeFactory<'_, R>,
        baseline: &ReferenceTrace,
    ) -> Result<(String, Option<f64>)> {
        let actual = self.generate(make, Some((0.0, 0.0)))?;
        expect_identical(baseline, &actual)?;
        let similarity = baseline.similarity(&actual)?;
        Ok((format!("cos_sim {:.6}", similarity), Some(similarity)))
    }

    fn abnormal_length<R: NativeRuntime>(&self, make: RuntimeFactory<'_, R>) -> Result<(String, Option<f64>)> {
        let mut pipeline = self.pipeline(make)?;
        let prompt = self.fixtures.prompt_tokens.repeat(1000);

        match pipeline.generate(&prompt, &self.fixtures.request()) {
            Err(e) if matches!(e.core_error(), Some(CoreError::CapacityExceeded { .. })) => {}
            Err(e) => return Err(e),
            Ok(_) => {
                return Err(HarnessError::VerificationFailed {
                    message: format!("{} prompt tokens were accepted", prompt.len()),
                })
            }
        }

        // the session keeps serving normal requests
        self.decode(&mut pipeline, "after_abnormal_length")?;
        Ok((format!("{} prompt tokens rejected", prompt.len()), None))
    }

    fn abnormal_stage<R: NativeRuntime>(&self, make: RuntimeFactory<'_, R>) -> Result<(String, Option<f64>)> {
        let config = self.fixtures.runtime_config();
        let stages = config.stages.to_table()?;
        let slots = config.slots.to_map()?;

        for index in [-1i64, 100] {
            let options = LoadOptions::from_config(&config).with_initial_stage(index);
            match ModelSession::load(make(&stages), options, stages.clone(), slots.clone()) {
                Err(ModelError::Core(CoreError::InvalidStage { .. })) => {}
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    return Err(HarnessError::VerificationFailed {
                        message: format!("cold load accepted stage {}", index),
                    })
                }
            }

            let mut pipeline = self.pipeline(make)?;
            match pipeline.session_mut().switch_stage(index) {
                Err(ModelError::Core(CoreError::InvalidStage { .. })) => {}
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    return Err(HarnessError::VerificationFailed {
                        message: format!("stage switch accepted {}", index),
                    })
                }
            }
            self.decode(&mut pipeline, "after_abnormal_stage")?;
        }

        Ok(("stages -1 and 100 rejected".to_string(), None))
    }
}

/// Tokens and hidden states must match the baseline exactly
fn expect_identical(baseline: &ReferenceTrace, actual: &ReferenceTrace) -> Result<()> {
    if baseline.token_ids != actual.token_ids {
        return Err(HarnessError::VerificationFailed {
            message: format!(
                "{} diverged from baseline: {:?} vs {:?}",
                actual.name, actual.token_ids, baseline.token_ids
            ),
        });
    }
    if baseline.hidden != actual.hidden {
        return Err(HarnessError::VerificationFailed {
            message: format!(
                "{} kept the baseline tokens but its hidden states differ (cos_sim {:.9})",
                actual.name,
                baseline.similarity(actual).unwrap_or(f64::NAN)
            ),
        });
    }
    Ok(())
}

/// An applied adapter must change the hidden states
fn expect_adapted(baseline: &ReferenceTrace, actual: &ReferenceTrace) -> Result<()> {
    if baseline.hidden == actual.hidden {
        return Err(HarnessError::VerificationFailed {
            message: format!("{} is identical to the baseline; adapter had no effect", actual.name),
        });
    }
    Ok(())
}
