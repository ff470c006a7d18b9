//! Model lifecycle.
//!
//! ```text
//! ModelRegistry::load_*()   load each artifact once, warm it up, validate it
//!      │
//!      ├─► Ready      every configured model loaded
//!      └─► Degraded   some failed, best-effort policy kept the rest
//!      │
//! read-only serving (handles cloned into the ensemble)
//!      │
//! drop at shutdown
//! ```
//!
//! Models are never reloaded per request. A load failure under
//! `DegradedPolicy::FailFast` aborts construction with `ModelsUnavailable`;
//! under `BestEffort` it is logged and recorded. Label-table disagreement is
//! always fatal.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, TussisError};
use crate::inference::ensemble::DegradedPolicy;
use crate::inference::{LabelTable, ModelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryState {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    /// Artifact path, or the model name for pre-built handles.
    pub source: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct ModelRegistry {
    models: Vec<ModelHandle>,
    failures: Vec<LoadFailure>,
    labels: LabelTable,
}

impl ModelRegistry {
    /// Load every path in `config.model_paths` as an ONNX artifact.
    #[cfg(feature = "onnx")]
    pub fn load_onnx(config: &PipelineConfig) -> Result<Self> {
        let options = crate::inference::OnnxOptions::from_config(config);
        Self::load_with(&config.model_paths, config, |dir| {
            crate::inference::OnnxClassifier::load(dir, &options).map(ModelHandle::new)
        })
    }

    /// Load `paths` with a caller-supplied loader.
    pub fn load_with<F>(paths: &[PathBuf], config: &PipelineConfig, loader: F) -> Result<Self>
    where
        F: Fn(&Path) -> Result<ModelHandle>,
    {
        if paths.is_empty() {
            return Err(TussisError::ModelsUnavailable(
                "no model paths configured".into(),
            ));
        }
        let candidates = paths
            .iter()
            .map(|path| (path.display().to_string(), loader(path)))
            .collect();
        Self::build(candidates, config)
    }

    /// Register already-constructed handles (embedding, tests).
    pub fn from_handles(handles: Vec<ModelHandle>, config: &PipelineConfig) -> Result<Self> {
        let candidates = handles
            .into_iter()
            .map(|h| (h.name().to_string(), Ok(h)))
            .collect();
        Self::build(candidates, config)
    }

    fn build(candidates: Vec<(String, Result<ModelHandle>)>, config: &PipelineConfig) -> Result<Self> {
        let total = candidates.len();
        let mut models: Vec<ModelHandle> = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (source, loaded) in candidates {
            let ready = loaded.and_then(|handle| {
                check_compatible(&handle, config)?;
                handle.0.warm_up()?;
                Ok(handle)
            });
            match ready {
                Ok(handle) => {
                    if let Some(first) = models.first() {
                        let expected = first.manifest().label_table();
                        let found = handle.manifest().label_table();
                        if !expected.same_space(&found) {
                            return Err(TussisError::LabelSpaceMismatch {
                                model: handle.name().to_string(),
                                expected: expected.labels,
                                found: found.labels,
                            });
                        }
                    }
                    info!(model = handle.name(), source = %source, "model ready");
                    models.push(handle);
                }
                Err(e) => match config.degraded_policy {
                    DegradedPolicy::FailFast => {
                        error!(source = %source, error = %e, "model failed to load");
                        return Err(TussisError::ModelsUnavailable(format!("{source}: {e}")));
                    }
                    DegradedPolicy::BestEffort => {
                        warn!(source = %source, error = %e, "model failed to load; continuing degraded");
                        failures.push(LoadFailure {
                            source,
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }

        let Some(first) = models.first() else {
            return Err(TussisError::ModelsUnavailable(format!(
                "none of {total} models could be loaded"
            )));
        };
        let labels = first.manifest().label_table();
        info!(
            loaded = models.len(),
            failed = failures.len(),
            classes = labels.len(),
            "model registry initialised"
        );
        Ok(Self {
            models,
            failures,
            labels,
        })
    }

    pub fn models(&self) -> &[ModelHandle] {
        &self.models
    }

    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn state(&self) -> RegistryState {
        if self.failures.is_empty() {
            RegistryState::Ready
        } else {
            RegistryState::Degraded
        }
    }
}

/// A model must accept the tensor the pipeline produces and expect the same
/// pixel scale.
fn check_compatible(handle: &ModelHandle, config: &PipelineConfig) -> Result<()> {
    let manifest = handle.manifest();
    let [h, w, _] = manifest.input_shape;
    let target = config.target_shape;
    if (h, w) != (target.height, target.width) {
        return Err(TussisError::IncompatibleModel {
            model: handle.name().to_string(),
            reason: format!(
                "expects {h}x{w} input, pipeline produces {}x{}",
                target.height, target.width
            ),
        });
    }
    if let Some(norm) = manifest.pixel_normalization {
        if norm != config.pixel_normalization {
            return Err(TussisError::IncompatibleModel {
                model: handle.name().to_string(),
                reason: format!(
                    "trained with {norm:?} pixel normalization, pipeline uses {:?}",
                    config.pixel_normalization
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::reshape::PixelNormalization;
    use crate::inference::stub::StubClassifier;
    use crate::inference::ModelManifest;

    const LABELS: [&str; 4] = ["asthma", "covid", "healthy", "tuberculosis"];

    fn stub(name: &str) -> ModelHandle {
        ModelHandle::new(StubClassifier::fixed(
            name,
            ModelManifest::with_labels(LABELS),
            vec![0.0; 4],
        ))
    }

    fn loader(path: &Path) -> Result<ModelHandle> {
        let name = path.display().to_string();
        if name.starts_with("missing") {
            return Err(TussisError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(stub(&name))
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn all_models_loaded_is_ready() {
        let config = PipelineConfig::default();
        let registry = ModelRegistry::load_with(&paths(&["a", "b"]), &config, loader).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(), RegistryState::Ready);
        assert_eq!(registry.labels().labels, LABELS.map(String::from).to_vec());
    }

    #[test]
    fn fail_fast_aborts_on_first_failure() {
        let config = PipelineConfig::default();
        let err = ModelRegistry::load_with(&paths(&["a", "missing-b"]), &config, loader).unwrap_err();
        assert!(matches!(err, TussisError::ModelsUnavailable(ref m) if m.contains("missing-b")));
    }

    #[test]
    fn best_effort_keeps_survivors() {
        let config = PipelineConfig {
            degraded_policy: DegradedPolicy::BestEffort,
            ..PipelineConfig::default()
        };
        let registry =
            ModelRegistry::load_with(&paths(&["missing-a", "b", "c"]), &config, loader).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(), RegistryState::Degraded);
        assert_eq!(registry.failures()[0].source, "missing-a");
    }

    #[test]
    fn best_effort_with_no_survivors_is_unavailable() {
        let config = PipelineConfig {
            degraded_policy: DegradedPolicy::BestEffort,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            ModelRegistry::load_with(&paths(&["missing-a", "missing-b"]), &config, loader),
            Err(TussisError::ModelsUnavailable(_))
        ));
        assert!(matches!(
            ModelRegistry::load_with(&[], &config, loader),
            Err(TussisError::ModelsUnavailable(_))
        ));
    }

    #[test]
    fn label_mismatch_is_fatal_even_in_best_effort() {
        let config = PipelineConfig {
            degraded_policy: DegradedPolicy::BestEffort,
            ..PipelineConfig::default()
        };
        let mut manifest = ModelManifest::with_labels(LABELS);
        manifest.label_version = "2".into();
        let other = ModelHandle::new(StubClassifier::fixed("v2", manifest, vec![0.0; 4]));
        assert!(matches!(
            ModelRegistry::from_handles(vec![stub("v1"), other], &config),
            Err(TussisError::LabelSpaceMismatch { .. })
        ));
    }

    #[test]
    fn incompatible_input_shape_is_rejected() {
        let mut manifest = ModelManifest::with_labels(LABELS);
        manifest.input_shape = [224, 224, 3];
        let odd = ModelHandle::new(StubClassifier::fixed("r50", manifest, vec![0.0; 4]));
        let err = ModelRegistry::from_handles(vec![odd], &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, TussisError::ModelsUnavailable(ref m) if m.contains("224x224")));
    }

    #[test]
    fn declared_normalization_must_match_pipeline() {
        let mut manifest = ModelManifest::with_labels(LABELS);
        manifest.pixel_normalization = Some(PixelNormalization::Torch);
        let torch = ModelHandle::new(StubClassifier::fixed("torch", manifest, vec![0.0; 4]));
        let config = PipelineConfig {
            degraded_policy: DegradedPolicy::BestEffort,
            ..PipelineConfig::default()
        };
        let registry = ModelRegistry::from_handles(vec![stub("tf"), torch], &config).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.failures()[0].reason.contains("Torch"));
    }
}
