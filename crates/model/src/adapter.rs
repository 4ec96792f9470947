//! Adapter hot-swap on a loaded session
//!
//! Adapters are applied by overwriting fixed weight slots in the resident
//! model and removed by zeroing those same slots. Slot addressing assumes
//! the target stage's graph is active, so callers switch stage first.

use std::path::Path;
use std::time::Instant;

use lorastage_core::AdapterBundle;

use crate::error::{ModelError, Result};
use crate::runtime::NativeRuntime;
use crate::session::{AppliedAdapter, ModelSession};

/// Bundle left applied after clearing `cleared` from `applied`
fn remaining(applied: AdapterBundle, cleared: AdapterBundle) -> Option<AdapterBundle> {
    let layers = applied.includes_layers() && !cleared.includes_layers();
    let embedding = applied.includes_embedding() && !cleared.includes_embedding();
    match (layers, embedding) {
        (true, true) => Some(AdapterBundle::AdapterAndEmbedding),
        (true, false) => Some(AdapterBundle::AdapterOnly),
        (false, true) => Some(AdapterBundle::EmbeddingOnly),
        (false, false) => None,
    }
}

impl<R: NativeRuntime> ModelSession<R> {
    /// Copy adapter weights from `source` into the slots of `bundle`.
    ///
    /// A different bundle that is currently applied is cleared first, so at
    /// most one adapter is tracked at a time. Re-applying the same bundle
    /// overwrites its slots in place.
    ///
    /// If the runtime rejects the data the targeted slots are zeroed again
    /// and the session keeps serving the base model.
    pub fn apply_adapter(&mut self, bundle: AdapterBundle, source: &Path) -> Result<()> {
        self.stage()?;
        if !source.exists() {
            return Err(ModelError::AdapterSourceNotFound(source.to_path_buf()));
        }

        if let Some(applied) = self.adapter.clone() {
            if applied.bundle != bundle {
                self.clear_adapter(applied.bundle)?;
            }
        }

        let selection = self.slots.select(bundle);
        let start = Instant::now();
        if let Err(e) = self
            .runtime
            .update_weights(&self.options.model_path, source, &selection)
        {
            tracing::warn!("Adapter {} from {} rejected: {}", bundle, source.display(), e);
            if let Err(zero_err) = self.runtime.zero_weights(&self.options.model_path, &selection) {
                tracing::warn!("Could not zero slots after failed apply: {}", zero_err);
            }
            self.adapter = None;
            return Err(ModelError::AdapterApplyFailed {
                status: e.status,
                message: e.message,
            });
        }

        self.adapter = Some(AppliedAdapter {
            bundle,
            source: source.to_path_buf(),
        });

        tracing::info!(
            "Applied {} from {} to {} slot groups in {:.3}s",
            bundle,
            source.display(),
            selection.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(())
    }

    /// Zero the slots of `bundle`, restoring base-model behavior.
    ///
    /// Clearing slots that hold nothing is allowed and leaves them zero.
    pub fn clear_adapter(&mut self, bundle: AdapterBundle) -> Result<()> {
        self.stage()?;

        let selection = self.slots.select(bundle);
        let start = Instant::now();
        self.runtime
            .zero_weights(&self.options.model_path, &selection)
            .map_err(|e| ModelError::AdapterApplyFailed {
                status: e.status,
                message: e.message,
            })?;

        self.adapter = self.adapter.take().and_then(|applied| {
            remaining(applied.bundle, bundle).map(|bundle| AppliedAdapter {
                bundle,
                source: applied.source,
            })
        });

        tracing::info!(
            "Cleared {} ({} slot groups) in {:.3}s",
            bundle,
            selection.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(())
    }

    /// Replace whatever adapter is applied with `next`, or with nothing.
    ///
    /// The new source is checked before anything is cleared.
    pub fn swap_adapter(&mut self, next: Option<(AdapterBundle, &Path)>) -> Result<()> {
        self.stage()?;
        if let Some((_, source)) = next {
            if !source.exists() {
                return Err(ModelError::AdapterSourceNotFound(source.to_path_buf()));
            }
        }

        if let Some(applied) = self.adapter.clone() {
            self.clear_adapter(applied.bundle)?;
        }

        match next {
            Some((bundle, source)) => self.apply_adapter(bundle, source),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoadOptions;
    use crate::simulated::{SimulatedAdapter, SimulatedModelSpec, SimulatedRuntime};
    use lorastage_core::{SlotKey, SlotMap, StageTable};
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        session: ModelSession<SimulatedRuntime>,
        adapter: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let spec = SimulatedModelSpec::default();
        let model_path = dir.path().join("model.bin");
        spec.write(&model_path).unwrap();

        let slots = SlotMap::build(spec.layer_count as i64).unwrap();
        let adapter = dir.path().join("adapter.bin");
        SimulatedAdapter::generate(
            &slots.select(AdapterBundle::AdapterAndEmbedding),
            spec.slot_len as usize,
            0.01,
            7,
        )
        .write(&adapter)
        .unwrap();

        let stages = StageTable::reference();
        let session = ModelSession::load(
            SimulatedRuntime::new(stages.clone()),
            LoadOptions::new(&model_path),
            stages,
            slots,
        )
        .unwrap();

        Fixture {
            _dir: dir,
            session,
            adapter,
        }
    }

    fn first_layer_key(session: &ModelSession<SimulatedRuntime>) -> SlotKey {
        session.slot_map().layers()[0].keys().next().unwrap()
    }

    #[test]
    fn test_remaining_bundle() {
        use AdapterBundle::*;
        assert_eq!(remaining(AdapterAndEmbedding, AdapterOnly), Some(EmbeddingOnly));
        assert_eq!(remaining(AdapterAndEmbedding, EmbeddingOnly), Some(AdapterOnly));
        assert_eq!(remaining(AdapterOnly, AdapterAndEmbedding), None);
        assert_eq!(remaining(AdapterOnly, EmbeddingOnly), Some(AdapterOnly));
    }

    #[test]
    fn test_apply_then_clear_zeroes_slots() {
        let mut f = fixture();
        let key = first_layer_key(&f.session);

        f.session
            .apply_adapter(AdapterBundle::AdapterOnly, &f.adapter)
            .unwrap();
        assert!(f.session.runtime().slot(key).unwrap().iter().any(|v| *v != 0.0));
        assert_eq!(
            f.session.applied_adapter().map(|a| a.bundle),
            Some(AdapterBundle::AdapterOnly)
        );

        f.session.clear_adapter(AdapterBundle::AdapterOnly).unwrap();
        assert!(f.session.runtime().slot(key).unwrap().iter().all(|v| *v == 0.0));
        assert!(f.session.applied_adapter().is_none());
    }

    #[test]
    fn test_missing_source_fails_before_runtime() {
        let mut f = fixture();
        let missing = f.adapter.with_file_name("nope.bin");

        let err = f
            .session
            .apply_adapter(AdapterBundle::AdapterOnly, &missing)
            .unwrap_err();
        assert!(matches!(err, ModelError::AdapterSourceNotFound(_)));
        assert!(err.is_recoverable());
        assert_eq!(f.session.runtime().counters().updates, 0);
        assert!(f.session.is_loaded());
    }

    #[test]
    fn test_apply_different_bundle_clears_previous() {
        let mut f = fixture();
        let layer_key = first_layer_key(&f.session);

        f.session
            .apply_adapter(AdapterBundle::AdapterOnly, &f.adapter)
            .unwrap();
        f.session
            .apply_adapter(AdapterBundle::EmbeddingOnly, &f.adapter)
            .unwrap();

        assert!(f.session.runtime().slot(layer_key).unwrap().iter().all(|v| *v == 0.0));
        assert_eq!(
            f.session.applied_adapter().map(|a| a.bundle),
            Some(AdapterBundle::EmbeddingOnly)
        );
    }

    #[test]
    fn test_partial_clear_keeps_other_slots() {
        let mut f = fixture();
        f.session
            .apply_adapter(AdapterBundle::AdapterAndEmbedding, &f.adapter)
            .unwrap();
        f.session.clear_adapter(AdapterBundle::EmbeddingOnly).unwrap();

        let runtime = f.session.runtime();
        for key in f.session.slot_map().select(AdapterBundle::AdapterOnly).keys() {
            assert!(
                runtime.slot(key).unwrap().iter().any(|v| *v != 0.0),
                "layer slot {:?} was cleared",
                key
            );
        }
        for key in f.session.slot_map().select(AdapterBundle::EmbeddingOnly).keys() {
            assert!(runtime.slot(key).unwrap().iter().all(|v| *v == 0.0));
        }
        assert_eq!(
            f.session.applied_adapter().map(|a| a.bundle),
            Some(AdapterBundle::AdapterOnly)
        );
    }

    #[test]
    fn test_rejected_adapter_leaves_base_model() {
        let mut f = fixture();
        let key = first_layer_key(&f.session);
        let partial = f.adapter.with_file_name("embedding_only.bin");
        SimulatedAdapter::generate(
            &f.session.slot_map().select(AdapterBundle::EmbeddingOnly),
            64,
            0.01,
            1,
        )
        .write(&partial)
        .unwrap();

        // layer records are missing from this file
        let err = f
            .session
            .apply_adapter(AdapterBundle::AdapterOnly, &partial)
            .unwrap_err();
        assert_eq!(err.status_code(), Some(-4));
        assert!(f.session.applied_adapter().is_none());
        assert!(f.session.runtime().slot(key).unwrap().iter().all(|v| *v == 0.0));
        assert!(f.session.is_loaded());
    }

    #[test]
    fn test_swap_to_none_and_back() {
        let mut f = fixture();

        f.session
            .swap_adapter(Some((AdapterBundle::AdapterAndEmbedding, f.adapter.as_path())))
            .unwrap();
        f.session.swap_adapter(None).unwrap();
        assert!(f.session.applied_adapter().is_none());

        let missing = f.adapter.with_file_name("missing.bin");
        f.session
            .swap_adapter(Some((AdapterBundle::AdapterOnly, f.adapter.as_path())))
            .unwrap();
        let zeros = f.session.runtime().counters().zeros;
        assert!(f
            .session
            .swap_adapter(Some((AdapterBundle::AdapterOnly, missing.as_path())))
            .is_err());
        // nothing was cleared for a missing source
        assert_eq!(f.session.runtime().counters().zeros, zeros);
        assert!(f.session.applied_adapter().is_some());
    }

    #[test]
    fn test_adapter_survives_stage_switch() {
        let mut f = fixture();
        let key = first_layer_key(&f.session);

        f.session
            .apply_adapter(AdapterBundle::AdapterOnly, &f.adapter)
            .unwrap();
        f.session.switch_stage(4).unwrap();

        assert!(f.session.runtime().slot(key).unwrap().iter().any(|v| *v != 0.0));
        assert!(f.session.applied_adapter().is_some());
    }
}
