use std::path::PathBuf;

use thiserror::Error;

/// All fatal errors produced by tussis-core.
///
/// Clips that are merely too short to analyse are *not* errors; they come back
/// as `Outcome::Unclassifiable` inside an `Ok`.
#[derive(Debug, Error)]
pub enum TussisError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("audio decode error: {0}")]
    AudioDecode(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("invalid model manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("checksum mismatch for {path}: expected {expected}, found {found}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("inference failed on model '{model}': {reason}")]
    Inference { model: String, reason: String },

    /// A tensor of the wrong dimensions reached a model. Never retried or coerced.
    #[error("shape contract violated for model '{model}': expected {expected:?}, got {actual:?}")]
    ShapeContractViolation {
        model: String,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("model '{model}' uses label table {found:?}, ensemble expects {expected:?}")]
    LabelSpaceMismatch {
        model: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("model '{model}' is incompatible with the pipeline: {reason}")]
    IncompatibleModel { model: String, reason: String },

    #[error("models unavailable: {0}")]
    ModelsUnavailable(String),

    #[error("classification timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TussisError {
    /// `true` for conditions that signal a programming error rather than bad
    /// input or a flaky model. These are never absorbed by degraded mode.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, TussisError::ShapeContractViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, TussisError>;
