//! Classification results as returned to callers.
//!
//! ## Shapes
//!
//! ```json
//! { "status": "classified",
//!   "predicted_label": "COVID-19",
//!   "confidence": "87.50%",
//!   "per_class_breakdown": { "COVID-19": "87.50%", "...": "..." },
//!   "diagnostics": { ... } }
//!
//! { "status": "unclassifiable",
//!   "reason": { "kind": "too_short", "duration_s": 0.5, "min_duration_s": 1.0 },
//!   "diagnostics": { ... } }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inference::ensemble::{EnsembleDecision, ModelVote};
use crate::inference::LabelTable;

/// Rendered in place of a percentage when no calibrated probability exists.
pub const NOT_COMPUTED: &str = "N/A";

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    Probability(f32),
    /// The fusion rule produced no probability. Never replaced by a made-up number.
    NotComputed,
}

impl Confidence {
    pub fn render(&self) -> String {
        match self {
            Self::Probability(p) => format_percent(*p),
            Self::NotComputed => NOT_COMPUTED.to_string(),
        }
    }
}

/// `0.875` → `"87.50%"`
pub fn format_percent(p: f32) -> String {
    format!("{:.2}%", p as f64 * 100.0)
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub predicted_label: String,
    pub confidence: String,
    pub per_class_breakdown: Option<BTreeMap<String, String>>,
}

/// Why a clip produced no classification. Not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnclassifiableReason {
    TooShort { duration_s: f32, min_duration_s: f32 },
    /// Post-trim signal shorter than one analysis frame.
    InsufficientSamples { samples: usize, n_fft: usize },
}

impl fmt::Display for UnclassifiableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort {
                duration_s,
                min_duration_s,
            } => write!(f, "clip is {duration_s:.2} s, minimum is {min_duration_s:.2} s"),
            Self::InsufficientSamples { samples, n_fft } => write!(
                f,
                "{samples} samples left after trimming, one frame needs {n_fft}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Classified(ClassificationReport),
    Unclassifiable { reason: UnclassifiableReason },
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Non-fatal conditions observed while handling one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// Clip was analysed at its declared rate.
    SampleRateMismatch { declared: u32, expected: u32 },
    Resampled { from: u32, to: u32 },
    /// Clip has no energy; features are a constant floor.
    SilentInput,
    ModelExcluded { model: String, reason: String },
}

/// Wall time per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub prepare_ms: f64,
    pub denoise_ms: f64,
    pub trim_ms: f64,
    pub spectral_ms: f64,
    pub reshape_ms: f64,
    pub inference_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallDiagnostics {
    pub warnings: Vec<PipelineWarning>,
    pub source_sample_rate: u32,
    pub duration_s: f32,
    pub trimmed_samples: Option<usize>,
    pub frames: Option<usize>,
    /// Winning class index and raw label, independent of display names.
    pub class_index: Option<usize>,
    pub label: Option<String>,
    pub votes: Vec<ModelVote>,
    pub tied: bool,
    pub timings: StageTimings,
}

impl CallDiagnostics {
    pub fn warn(&mut self, warning: PipelineWarning) {
        self.warnings.push(warning);
    }
}

/// Result of one request: an outcome plus what happened along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(flatten)]
    pub outcome: Outcome,
    pub diagnostics: CallDiagnostics,
}

impl Classification {
    pub fn is_classified(&self) -> bool {
        matches!(self.outcome, Outcome::Classified(_))
    }

    pub fn report(&self) -> Option<&ClassificationReport> {
        match &self.outcome {
            Outcome::Classified(report) => Some(report),
            Outcome::Unclassifiable { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&UnclassifiableReason> {
        match &self.outcome {
            Outcome::Classified(_) => None,
            Outcome::Unclassifiable { reason } => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ResultFormatter {
    include_breakdown: bool,
}

impl ResultFormatter {
    pub fn new(include_breakdown: bool) -> Self {
        Self { include_breakdown }
    }

    pub fn format(&self, decision: &EnsembleDecision, labels: &LabelTable) -> ClassificationReport {
        let predicted_label = labels
            .display(decision.index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", decision.index));

        let per_class_breakdown = decision
            .probabilities
            .as_ref()
            .filter(|_| self.include_breakdown)
            .map(|probs| {
                probs
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| {
                        let name = labels
                            .display(i)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("class_{i}"));
                        (name, format_percent(p))
                    })
                    .collect()
            });

        ClassificationReport {
            predicted_label,
            confidence: decision.confidence.render(),
            per_class_breakdown,
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(true)
    }
}
