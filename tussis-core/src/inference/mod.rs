//! Classifier abstraction.
//!
//! The `Classifier` trait decouples the pipeline from any specific backend
//! (ONNX session, quantized ONNX session, test stub). Single-model and
//! N-model ensembles are both built from `ModelHandle`s; which one runs is
//! decided once, when the ensemble is constructed.
//!
//! `infer` takes `&self`: a loaded model is shared read-only by every request.
//! Backends that need exclusive access per call (ORT sessions) serialise
//! internally.

pub mod ensemble;
pub mod manifest;
pub mod registry;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxClassifier, OnnxOptions};

pub use manifest::{LabelTable, ModelManifest, OutputKind};

use std::sync::Arc;

use crate::dsp::reshape::FixedTensor;
use crate::error::{Result, TussisError};

/// Contract for classification backends.
pub trait Classifier: Send + Sync {
    /// Identifier used in logs, warnings and error messages.
    fn name(&self) -> &str;

    fn manifest(&self) -> &ModelManifest;

    /// One-time warm-up, e.g. a dummy inference to populate caches. Called
    /// once by the registry after loading.
    ///
    /// # Errors
    /// Returns an error if the model cannot run at all.
    fn warm_up(&self) -> Result<()>;

    /// Score one `(H, W, 3)` tensor.
    ///
    /// # Errors
    /// `ShapeContractViolation` when `input` does not match the declared
    /// input shape; `Inference`/`OnnxSession` for backend failures.
    fn infer(&self, input: &FixedTensor) -> Result<ScoreVector>;
}

/// Shared, read-only handle to any `Classifier` implementor.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<dyn Classifier>);

impl ModelHandle {
    pub fn new<C: Classifier + 'static>(model: C) -> Self {
        Self(Arc::new(model))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn manifest(&self) -> &ModelManifest {
        self.0.manifest()
    }

    /// Checks the shape contract, then delegates to the backend and checks
    /// the score count against the label table.
    pub fn infer(&self, input: &FixedTensor) -> Result<ScoreVector> {
        check_input_shape(self.name(), self.manifest().input_shape, input)?;
        let scores = self.0.infer(input)?;
        let expected = self.manifest().labels.len();
        if scores.len() != expected {
            return Err(TussisError::Inference {
                model: self.name().to_string(),
                reason: format!("expected {expected} scores, got {}", scores.len()),
            });
        }
        Ok(scores)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

pub fn check_input_shape(model: &str, expected: [usize; 3], input: &FixedTensor) -> Result<()> {
    let actual = input.shape();
    if actual != expected {
        return Err(TussisError::ShapeContractViolation {
            model: model.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Raw class scores as produced by one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector {
    values: Vec<f32>,
    kind: OutputKind,
}

impl ScoreVector {
    pub fn new(values: Vec<f32>, kind: OutputKind) -> Self {
        Self { values, kind }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Softmax of logits; probability outputs are passed through.
    pub fn probabilities(&self) -> Vec<f32> {
        match self.kind {
            OutputKind::Logits => softmax(&self.values),
            OutputKind::Probabilities => self.values.clone(),
        }
    }
}

/// `e^(x − max) / Σ e^(x − max)`. Non-finite inputs count as `-inf`.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        let n = values.len().max(1) as f32;
        return vec![1.0 / n; values.len()];
    }
    let exps: Vec<f32> = values
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; the lowest index wins ties. NaN never wins.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
