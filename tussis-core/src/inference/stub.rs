//! `StubClassifier`: deterministic backend for tests and dry runs.
//!
//! Returns fixed or scripted scores through the same `Classifier` interface
//! as the ONNX backend. It is never substituted for a model that failed to
//! load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::dsp::reshape::FixedTensor;
use crate::error::{Result, TussisError};
use crate::inference::{Classifier, ModelManifest, ScoreVector};

type ScoreFn = dyn Fn(&FixedTensor) -> Vec<f32> + Send + Sync;

#[derive(Clone)]
enum Behaviour {
    Fixed(Vec<f32>),
    Scripted(Arc<ScoreFn>),
    Failing(String),
}

/// Clones share the call counter, so a test can keep one copy and hand the
/// other to a `ModelHandle`.
#[derive(Clone)]
pub struct StubClassifier {
    name: String,
    manifest: ModelManifest,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

impl StubClassifier {
    fn build(name: &str, manifest: ModelManifest, behaviour: Behaviour) -> Self {
        Self {
            name: name.to_string(),
            manifest,
            behaviour,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns `scores`, interpreted per `manifest.output`.
    pub fn fixed(name: &str, manifest: ModelManifest, scores: Vec<f32>) -> Self {
        Self::build(name, manifest, Behaviour::Fixed(scores))
    }

    /// Computes scores from the input tensor.
    pub fn scripted<F>(name: &str, manifest: ModelManifest, score: F) -> Self
    where
        F: Fn(&FixedTensor) -> Vec<f32> + Send + Sync + 'static,
    {
        Self::build(name, manifest, Behaviour::Scripted(Arc::new(score)))
    }

    /// Every inference fails with `Inference { reason }`.
    pub fn failing(name: &str, manifest: ModelManifest, reason: &str) -> Self {
        Self::build(name, manifest, Behaviour::Failing(reason.to_string()))
    }

    /// Number of `infer` calls that reached this stub.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    fn warm_up(&self) -> Result<()> {
        debug!(model = %self.name, "StubClassifier::warm_up (no-op)");
        Ok(())
    }

    fn infer(&self, input: &FixedTensor) -> Result<ScoreVector> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let values = match &self.behaviour {
            Behaviour::Fixed(scores) => scores.clone(),
            Behaviour::Scripted(score) => score(input),
            Behaviour::Failing(reason) => {
                return Err(TussisError::Inference {
                    model: self.name.clone(),
                    reason: reason.clone(),
                })
            }
        };
        Ok(ScoreVector::new(values, self.manifest.output))
    }
}
