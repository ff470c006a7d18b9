//! Pipeline configuration (JSON file + `TUSSIS_*` environment overrides).
//!
//! ```text
//! PipelineConfig::default()
//!     └─► load(path)              JSON, missing keys fall back to defaults
//!         └─► apply_env_overrides()
//!             └─► normalize() + validate()
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::denoise::DenoiseMode;
use crate::dsp::reshape::PixelNormalization;
use crate::error::{Result, TussisError};
use crate::inference::ensemble::{DegradedPolicy, EnsembleConfidence, TieBreak};

/// Fixed (height, width) of the tensor fed to every classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetShape {
    pub height: usize,
    pub width: usize,
}

impl Default for TargetShape {
    fn default() -> Self {
        Self {
            height: 240,
            width: 240,
        }
    }
}

/// Every knob the pipeline recognises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rate the models were trained at (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Clips shorter than this are not classified. Default: 1.0 s.
    pub min_duration_s: f32,
    /// Trim threshold below the loudest frame (dB). Default: 40.
    pub silence_threshold_db: f32,
    pub trim_frame_length: usize,
    pub trim_hop_length: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub target_shape: TargetShape,
    /// Dynamic range kept by the dB compression. Default: 80.
    pub top_db: f32,
    pub pixel_normalization: PixelNormalization,
    pub tie_break: TieBreak,
    pub degraded_policy: DegradedPolicy,
    pub ensemble_confidence: EnsembleConfidence,
    /// Run ensemble members on scoped threads. Default: true.
    pub parallel_inference: bool,
    pub denoise: DenoiseMode,
    /// Resample clips tagged with a different rate instead of only warning.
    pub resample_mismatched: bool,
    /// Emit the per-class percentage map in reports.
    pub include_breakdown: bool,
    /// Caller-level timeout for `classify_file_async`. `None` disables it.
    pub request_timeout_ms: Option<u64>,
    /// Model artifact directories, each holding `manifest.json` + model file.
    pub model_paths: Vec<PathBuf>,
    /// ONNX execution provider preference: `auto`, `cpu` or `directml`.
    pub ort_ep: String,
    pub ort_intra_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            min_duration_s: 1.0,
            silence_threshold_db: 40.0,
            trim_frame_length: 2048,
            trim_hop_length: 512,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            target_shape: TargetShape::default(),
            top_db: 80.0,
            pixel_normalization: PixelNormalization::Tf,
            tie_break: TieBreak::LowestIndex,
            degraded_policy: DegradedPolicy::FailFast,
            ensemble_confidence: EnsembleConfidence::NotComputed,
            parallel_inference: true,
            denoise: DenoiseMode::SpectralGate,
            resample_mismatched: false,
            include_breakdown: true,
            request_timeout_ms: None,
            model_paths: Vec::new(),
            ort_ep: "auto".into(),
            ort_intra_threads: None,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Unknown keys are ignored, missing keys default.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .map_err(|e| TussisError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults. Env overrides,
    /// normalization and validation are applied in both cases.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("TUSSIS_SAMPLE_RATE") {
            self.sample_rate = v
                .parse()
                .map_err(|_| TussisError::Config(format!("TUSSIS_SAMPLE_RATE={v}")))?;
        }
        if let Some(v) = env_var("TUSSIS_MODEL_PATHS") {
            self.model_paths = std::env::split_paths(&v).collect();
        }
        if let Some(v) = env_var("TUSSIS_ORT_EP") {
            self.ort_ep = v;
        }
        if let Some(v) = env_var("TUSSIS_DEGRADED_POLICY") {
            self.degraded_policy = parse_enum("TUSSIS_DEGRADED_POLICY", &v)?;
        }
        if let Some(v) = env_var("TUSSIS_PIXEL_NORMALIZATION") {
            self.pixel_normalization = parse_enum("TUSSIS_PIXEL_NORMALIZATION", &v)?;
        }
        if let Some(v) = env_var("TUSSIS_REQUEST_TIMEOUT_MS") {
            let ms: u64 = v
                .parse()
                .map_err(|_| TussisError::Config(format!("TUSSIS_REQUEST_TIMEOUT_MS={v}")))?;
            self.request_timeout_ms = (ms > 0).then_some(ms);
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.ort_ep = match self.ort_ep.trim().to_ascii_lowercase().as_str() {
            "cpu" => "cpu".into(),
            "dml" | "directml" => "directml".into(),
            _ => "auto".into(),
        };
        let mut seen: Vec<PathBuf> = Vec::with_capacity(self.model_paths.len());
        for path in self.model_paths.drain(..) {
            if path.as_os_str().is_empty() || seen.contains(&path) {
                continue;
            }
            seen.push(path);
        }
        self.model_paths = seen;
        self.ort_intra_threads = self.ort_intra_threads.map(|n| n.clamp(1, 32));
        if self.request_timeout_ms == Some(0) {
            self.request_timeout_ms = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(TussisError::Config(msg.to_string()));
        if self.sample_rate == 0 {
            return fail("sample_rate must be > 0");
        }
        if !(self.min_duration_s.is_finite() && self.min_duration_s >= 0.0) {
            return fail("min_duration_s must be a non-negative number");
        }
        if !(self.silence_threshold_db.is_finite() && self.silence_threshold_db > 0.0) {
            return fail("silence_threshold_db must be > 0");
        }
        if self.trim_frame_length == 0 || self.trim_hop_length == 0 {
            return fail("trim_frame_length and trim_hop_length must be > 0");
        }
        if self.n_fft < 2 || self.hop_length == 0 {
            return fail("n_fft must be >= 2 and hop_length > 0");
        }
        if self.n_mels == 0 {
            return fail("n_mels must be > 0");
        }
        if self.target_shape.height == 0 || self.target_shape.width == 0 {
            return fail("target_shape dimensions must be > 0");
        }
        if !(self.top_db.is_finite() && self.top_db > 0.0) {
            return fail("top_db must be > 0");
        }
        if let TieBreak::Priority { order } = &self.tie_break {
            if order.is_empty() {
                return fail("tie_break priority order must name at least one label");
            }
        }
        if self.n_mels != self.target_shape.height {
            warn!(
                n_mels = self.n_mels,
                target_height = self.target_shape.height,
                "mel band count differs from target height; spectrograms will be resized"
            );
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_enum<T: serde::de::DeserializeOwned>(name: &str, raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| TussisError::Config(format!("{name}: unrecognised value '{raw}'")))
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Tussis")
            .join("config.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("tussis")
            .join("config.json")
    }
}
