//! # tussis-core
//!
//! Cough-recording classification engine.
//!
//! ## Architecture
//!
//! ```text
//! WAV / samples → Waveform (mono, peak-normalized)
//!                     │
//!               Denoiser → SilenceTrimmer
//!                     │
//!               SpectralAnalyzer (STFT → mel → dB)
//!                     │
//!               ShapeReconciler → FixedTensor [H, W, 3]
//!                     │
//!               ClassifierEnsemble (1..n models, vote + tie-break)
//!                     │
//!               ResultFormatter → Classification
//! ```
//!
//! Models are loaded once by `ModelRegistry`; `TussisEngine` is read-only
//! afterwards and serves concurrent requests.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod inference;
pub mod report;

// Convenience re-exports for downstream crates
pub use audio::Waveform;
pub use config::{PipelineConfig, TargetShape};
pub use engine::{CountersSnapshot, Prepared, TussisEngine};
pub use error::{Result, TussisError};
pub use inference::ensemble::{DegradedPolicy, EnsembleMode, TieBreak};
pub use inference::registry::{ModelRegistry, RegistryState};
pub use inference::{Classifier, LabelTable, ModelHandle, ModelManifest};
pub use report::{Classification, ClassificationReport, Outcome, UnclassifiableReason};

#[cfg(feature = "onnx")]
pub use inference::{OnnxClassifier, OnnxOptions};
