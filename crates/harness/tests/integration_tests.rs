//! lorastage integration tests
//!
//! End-to-end checks of stage selection, adapter hot-swap and decoding on
//! the simulated runtime.

use std::path::{Path, PathBuf};

use lorastage_core::{
    AdapterBundle, CoreError, GenerationConfig, RuntimeConfig, SlotMap, REFERENCE_LAYER_COUNT,
};
use lorastage_harness::{
    write_fixtures, FixtureOptions, FixtureSet, GenerationRequest, HarnessError, LoraPipeline,
    ReferenceTrace,
};
use lorastage_model::{
    ByteCodec, ModelError, SessionState, SimulatedAdapter, SimulatedModelSpec, SimulatedRuntime,
    StopReason,
};

fn write_model(dir: &Path) -> RuntimeConfig {
    let config = RuntimeConfig {
        model_path: dir.join("model.bin"),
        ..RuntimeConfig::default()
    };
    SimulatedModelSpec::default().write(&config.model_path).unwrap();
    config
}

fn pipeline(config: &RuntimeConfig) -> LoraPipeline<SimulatedRuntime> {
    let runtime = SimulatedRuntime::new(config.stages.to_table().unwrap());
    LoraPipeline::new(runtime, config, Box::new(ByteCodec::default())).unwrap()
}

fn fixture_pipeline(fixtures: &FixtureSet) -> LoraPipeline<SimulatedRuntime> {
    pipeline(&fixtures.runtime_config())
}

fn write_adapter(dir: &Path, name: &str, bundle: AdapterBundle, scale: f32, seed: u64) -> PathBuf {
    let path = dir.join(name);
    let selection = SlotMap::build(REFERENCE_LAYER_COUNT).unwrap().select(bundle);
    SimulatedAdapter::generate(&selection, SimulatedModelSpec::default().slot_len as usize, scale, seed)
        .write(&path)
        .unwrap();
    path
}

fn greedy(max_new_tokens: usize) -> GenerationRequest {
    GenerationRequest::new(GenerationConfig::greedy(max_new_tokens))
}

// =============================================================================
// Section 1: Decoding
// =============================================================================

mod decode_tests {
    use super::*;

    /// 20 tokens take exactly one prefill and 20 decode steps
    #[test]
    fn test_twenty_token_generation() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let (text, output) = pipeline
            .chat(lorastage_harness::SAMPLE_QUESTION, &greedy(20))
            .unwrap();

        assert_eq!(output.token_ids.len(), 20);
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
        assert!(!text.is_empty());

        let counters = pipeline.session().runtime().counters();
        assert_eq!(counters.prefills, 1);
        assert_eq!(counters.decode_steps, 20);
        assert_eq!(output.metrics.decode_steps, 20);
    }

    #[test]
    fn test_streaming_sees_every_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let mut streamed = Vec::new();
        let output = pipeline
            .generate_streaming(&[10, 20, 30], &greedy(12), |t| streamed.push(t))
            .unwrap();
        assert_eq!(streamed, output.token_ids);
    }

    #[test]
    fn test_repeated_requests_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let first = pipeline.generate(&[1, 2, 3, 4], &greedy(16)).unwrap();
        let second = pipeline.generate(&[1, 2, 3, 4], &greedy(16)).unwrap();
        assert_eq!(first.token_ids, second.token_ids);
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let err = pipeline.generate(&[], &greedy(4)).unwrap_err();
        assert!(matches!(err, HarnessError::Model(ModelError::EmptyInput)));
        assert_eq!(pipeline.session().runtime().counters().prefills, 0);
    }
}

// =============================================================================
// Section 2: Stage Selection
// =============================================================================

mod stage_tests {
    use super::*;

    /// An oversized prompt is rejected before any runtime call
    #[test]
    fn test_oversized_prompt_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);
        let before = pipeline.session().runtime().counters();

        let prompt = vec![7u32; 9000];
        let err = pipeline.generate(&prompt, &greedy(20)).unwrap_err();
        assert!(matches!(
            err.core_error(),
            Some(CoreError::CapacityExceeded {
                total_length: 9020,
                prompt_length: 9000
            })
        ));
        assert_eq!(pipeline.session().runtime().counters(), before);

        // the session still serves normal requests
        assert_eq!(pipeline.generate(&[1, 2], &greedy(3)).unwrap().token_ids.len(), 3);
    }

    #[test]
    fn test_invalid_stage_indices_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);
        let before = pipeline.session().runtime().counters();

        for index in [-1i64, 100] {
            let err = pipeline.session_mut().switch_stage(index).unwrap_err();
            assert!(matches!(err, ModelError::Core(CoreError::InvalidStage { .. })));
        }
        assert_eq!(pipeline.session().runtime().counters(), before);
        assert!(pipeline.session().is_loaded());
    }

    /// Stage switches re-initialise without reading weights again
    #[test]
    fn test_weights_read_once_across_switches() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let small = pipeline.generate(&[5; 100], &greedy(10)).unwrap();
        let large = pipeline.generate(&[5; 2500], &greedy(10)).unwrap();
        let small_again = pipeline.generate(&[5; 100], &greedy(10)).unwrap();

        assert!(small.stage.max_total_length < large.stage.max_total_length);
        assert_eq!(small.stage, small_again.stage);
        assert_eq!(small.token_ids, small_again.token_ids);

        let counters = pipeline.session().runtime().counters();
        assert_eq!(counters.weight_reads, 1);
        assert!(counters.inits >= 3);
        assert_eq!(pipeline.session().weight_reads(), 1);
    }

    #[test]
    fn test_plan_matches_generation_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let generation = GenerationConfig::greedy(64);
        let planned = pipeline.plan(1500, &generation).unwrap();
        let output = pipeline
            .generate(&vec![3u32; 1500], &GenerationRequest::new(generation))
            .unwrap();
        assert_eq!(output.stage, planned);
    }
}

// =============================================================================
// Section 3: Adapter Hot-Swap
// =============================================================================

mod adapter_tests {
    use super::*;

    #[test]
    fn test_apply_clear_cycles_match_base_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let adapter = write_adapter(dir.path(), "a.bin", AdapterBundle::AdapterAndEmbedding, 0.005, 1);
        let mut pipeline = pipeline(&config);
        let prompt = [11u32, 12, 13, 14];

        let base = pipeline.generate(&prompt, &greedy(20)).unwrap();
        for _ in 0..5 {
            let session = pipeline.session_mut();
            session
                .apply_adapter(AdapterBundle::AdapterAndEmbedding, &adapter)
                .unwrap();
            session.clear_adapter(AdapterBundle::AdapterAndEmbedding).unwrap();
        }
        let after = pipeline.generate(&prompt, &greedy(20)).unwrap();

        assert_eq!(after.token_ids, base.token_ids);
        assert_eq!(after.hidden_trace, base.hidden_trace);
    }

    #[test]
    fn test_zero_scale_adapter_matches_base_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let zero = write_adapter(dir.path(), "zero.bin", AdapterBundle::AdapterAndEmbedding, 0.0, 3);
        let mut pipeline = pipeline(&config);
        let prompt = [40u32, 41, 42];

        let base = pipeline.generate(&prompt, &greedy(20)).unwrap();
        let with_zero = pipeline
            .generate(
                &prompt,
                &greedy(20).with_adapter(AdapterBundle::AdapterAndEmbedding, &zero),
            )
            .unwrap();
        assert_eq!(with_zero.token_ids, base.token_ids);
    }

    /// Swapping bundles leaves nothing of the previous adapter behind
    #[test]
    fn test_swap_removes_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let layers = write_adapter(dir.path(), "layers.bin", AdapterBundle::AdapterOnly, 0.5, 5);
        let embedding = write_adapter(dir.path(), "emb.bin", AdapterBundle::EmbeddingOnly, 0.5, 6);
        let prompt = [7u32, 8, 9];

        // only the embedding adapter, on a fresh session
        let mut fresh = pipeline(&config);
        let expected = fresh
            .generate(
                &prompt,
                &greedy(10).with_adapter(AdapterBundle::EmbeddingOnly, &embedding),
            )
            .unwrap();

        // layers first, then swapped for the embedding adapter
        let mut swapped = pipeline(&config);
        swapped
            .generate(&prompt, &greedy(10).with_adapter(AdapterBundle::AdapterOnly, &layers))
            .unwrap();
        let actual = swapped
            .generate(
                &prompt,
                &greedy(10).with_adapter(AdapterBundle::EmbeddingOnly, &embedding),
            )
            .unwrap();

        assert_eq!(actual.token_ids, expected.token_ids);
        let applied = swapped.session().applied_adapter().unwrap();
        assert_eq!(applied.bundle, AdapterBundle::EmbeddingOnly);
    }

    #[test]
    fn test_missing_adapter_keeps_session_usable() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);

        let request = greedy(5).with_adapter(AdapterBundle::AdapterOnly, dir.path().join("nope.bin"));
        let err = pipeline.generate(&[1, 2, 3], &request).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Model(ModelError::AdapterSourceNotFound(_))
        ));
        assert!(pipeline.session().applied_adapter().is_none());
        assert_eq!(pipeline.generate(&[1, 2, 3], &greedy(5)).unwrap().token_ids.len(), 5);
    }
}

// =============================================================================
// Section 4: Reference Similarity
// =============================================================================

mod reference_tests {
    use super::*;

    fn fixtures(dir: &Path) -> FixtureSet {
        write_fixtures(dir, &FixtureOptions::default()).unwrap()
    }

    /// A small adapter moves the hidden states yet tracks its reference
    #[test]
    fn test_scaled_adapter_tracks_reference() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = fixtures(dir.path());
        let case = fixtures.case(0.01, 0.01).unwrap();
        let reference = fixtures.reference(case).unwrap();

        let mut pipeline = fixture_pipeline(&fixtures);
        let base = pipeline
            .generate(&fixtures.prompt_tokens, &fixtures.request())
            .unwrap();
        let base = ReferenceTrace::from_output("base", &base).unwrap();

        let request = fixtures
            .request()
            .with_adapter(AdapterBundle::AdapterAndEmbedding, fixtures.adapter_path(case));
        let output = pipeline.generate(&fixtures.prompt_tokens, &request).unwrap();
        let actual = ReferenceTrace::from_output("run", &output).unwrap();

        assert_eq!(output.token_ids.len(), 20);
        assert_ne!(actual.hidden, base.hidden);
        assert_ne!(reference.hidden, base.hidden);
        let key = pipeline.session().slot_map().layers()[0].keys().next().unwrap();
        let slot = pipeline.session().runtime().slot(key).unwrap();
        assert!(slot.iter().any(|v| *v != 0.0));

        let similarity = reference.check(&actual, 0.8).unwrap();
        assert!(similarity >= 0.8);
    }

    #[test]
    fn test_truncated_trace_fails_check() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = fixtures(dir.path());
        let case = fixtures.case(0.01, 0.01).unwrap();
        let reference = fixtures.reference(case).unwrap();

        let mut pipeline = fixture_pipeline(&fixtures);
        let request = GenerationRequest::new(GenerationConfig::greedy(5))
            .with_adapter(AdapterBundle::AdapterAndEmbedding, fixtures.adapter_path(case));
        let output = pipeline.generate(&fixtures.prompt_tokens, &request).unwrap();
        let short = ReferenceTrace::from_output("short", &output).unwrap();

        assert!(matches!(
            reference.check(&short, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_large_adapter_fails_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = fixtures(dir.path());
        let case = fixtures.case(0.0, 0.0).unwrap();
        let reference = fixtures.reference(case).unwrap();
        let large = write_adapter(dir.path(), "large.bin", AdapterBundle::AdapterOnly, 5.0, 77);

        let mut pipeline = fixture_pipeline(&fixtures);
        let request = fixtures
            .request()
            .with_adapter(AdapterBundle::AdapterOnly, &large);
        let output = pipeline.generate(&fixtures.prompt_tokens, &request).unwrap();
        let actual = ReferenceTrace::from_output("large", &output).unwrap();

        match reference.check(&actual, 0.999) {
            Err(HarnessError::SimilarityBelowThreshold { case, threshold, .. }) => {
                assert_eq!(case, "scale0_embedding_scale0");
                assert_eq!(threshold, 0.999);
            }
            other => panic!("expected similarity failure, got {:?}", other),
        }
    }
}

// =============================================================================
// Section 5: Session Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_teardown_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model(dir.path());
        let mut pipeline = pipeline(&config);
        let before = pipeline.generate(&[2, 4, 6], &greedy(8)).unwrap();

        pipeline.session_mut().teardown().unwrap();
        assert_eq!(pipeline.session().state(), SessionState::Closed);
        let err = pipeline.generate(&[2, 4, 6], &greedy(8)).unwrap_err();
        assert!(matches!(err, HarnessError::Model(ModelError::SessionClosed)));

        // teardown is idempotent
        pipeline.session_mut().teardown().unwrap();

        pipeline.session_mut().reload().unwrap();
        let after = pipeline.generate(&[2, 4, 6], &greedy(8)).unwrap();
        assert_eq!(after.token_ids, before.token_ids);
        assert_eq!(pipeline.session().weight_reads(), 2);
    }

    #[test]
    fn test_missing_model_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            model_path: dir.path().join("absent.bin"),
            ..RuntimeConfig::default()
        };
        let runtime = SimulatedRuntime::new(config.stages.to_table().unwrap());

        match LoraPipeline::new(runtime, &config, Box::new(ByteCodec::default())) {
            Err(HarnessError::Model(ModelError::ModelNotFound(path))) => {
                assert_eq!(path, config.model_path);
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("load succeeded without a model file"),
        }
    }
}

// =============================================================================
// Section 6: Slot Addressing
// =============================================================================

mod slot_tests {
    use super::*;

    #[test]
    fn test_reference_wire_strings() {
        let map = SlotMap::build(REFERENCE_LAYER_COUNT).unwrap();

        let layers = map.select(AdapterBundle::AdapterOnly).to_wire();
        assert!(layers.graph.starts_with("0,2,4,"));
        assert!(layers.graph.ends_with(",52,54"));
        assert!(layers.region.ends_with(",26,27"));

        let embedding = map.select(AdapterBundle::EmbeddingOnly).to_wire();
        assert_eq!(embedding.graph, "56");
        assert_eq!(embedding.region, "28");
        assert_eq!(embedding.weights, vec!["0,1".to_string()]);

        let both = map.select(AdapterBundle::AdapterAndEmbedding).to_wire();
        assert_eq!(both.weights.len(), 29);
        assert_eq!(both.parse().unwrap(), map.select(AdapterBundle::AdapterAndEmbedding));
    }
}
