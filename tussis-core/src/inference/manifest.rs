//! Model artifact manifest.
//!
//! Every model directory carries a `manifest.json` next to the model file:
//!
//! ```json
//! {
//!   "name": "effnet-b1",
//!   "model_file": "model.onnx",
//!   "labels": ["asthma", "covid", "healthy", "tuberculosis"],
//!   "display_names": ["Hen suyễn", "COVID-19", "Khỏe mạnh", "Lao"],
//!   "label_version": "2024-05",
//!   "output": "logits",
//!   "input_shape": [240, 240, 3],
//!   "layout": "nhwc",
//!   "precision": "float32",
//!   "sha256": "…"
//! }
//! ```
//!
//! The label table travels with the weights so an ensemble can refuse members
//! trained on a different class order.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::dsp::reshape::PixelNormalization;
use crate::error::{Result, TussisError};

pub const MANIFEST_FILE: &str = "manifest.json";

/// What the model's output tensor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Logits,
    Probabilities,
}

/// Memory order of the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, H, W, 3]` (Keras exports).
    #[default]
    Nhwc,
    /// `[1, 3, H, W]` (PyTorch exports).
    Nchw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float32,
    /// u8 input/output with affine quantization parameters.
    Quantized,
}

/// `real = scale · (q − zero_point)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn quantize(&self, value: f32) -> u8 {
        let q = (value / self.scale).round() + self.zero_point as f32;
        q.clamp(0.0, 255.0) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        self.scale * (q as i32 - self.zero_point) as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelManifest {
    pub name: Option<String>,
    pub model_file: String,
    pub labels: Vec<String>,
    pub display_names: Option<Vec<String>>,
    pub label_version: String,
    pub output: OutputKind,
    /// `[height, width, channels]` independent of `layout`.
    pub input_shape: [usize; 3],
    pub layout: TensorLayout,
    pub precision: Precision,
    pub input_quantization: Option<QuantParams>,
    pub output_quantization: Option<QuantParams>,
    /// Normalization the model was trained with, checked against the pipeline.
    pub pixel_normalization: Option<PixelNormalization>,
    pub input_name: Option<String>,
    pub output_name: Option<String>,
    /// Hex digest of the model file.
    pub sha256: Option<String>,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            name: None,
            model_file: "model.onnx".into(),
            labels: Vec::new(),
            display_names: None,
            label_version: "1".into(),
            output: OutputKind::Logits,
            input_shape: [240, 240, 3],
            layout: TensorLayout::Nhwc,
            precision: Precision::Float32,
            input_quantization: None,
            output_quantization: None,
            pixel_normalization: None,
            input_name: None,
            output_name: None,
            sha256: None,
        }
    }
}

impl ModelManifest {
    pub fn with_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Read and validate `<dir>/manifest.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(TussisError::ModelNotFound { path });
        }
        let raw = fs::read_to_string(&path)?;
        let manifest: ModelManifest =
            serde_json::from_str(&raw).map_err(|e| TussisError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        manifest
            .validate()
            .map_err(|reason| TussisError::ManifestInvalid {
                path: path.clone(),
                reason,
            })?;
        debug!(path = %path.display(), classes = manifest.labels.len(), "manifest loaded");
        Ok(manifest)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.labels.is_empty() {
            return Err("labels must not be empty".into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.labels.iter().find(|l| !seen.insert(l.as_str())) {
            return Err(format!("duplicate label '{dup}'"));
        }
        if let Some(names) = &self.display_names {
            if names.len() != self.labels.len() {
                return Err(format!(
                    "display_names has {} entries, labels has {}",
                    names.len(),
                    self.labels.len()
                ));
            }
        }
        if self.input_shape.iter().any(|&d| d == 0) {
            return Err("input_shape dimensions must be > 0".into());
        }
        if self.input_shape[2] != 3 {
            return Err(format!(
                "input_shape must have 3 channels, got {}",
                self.input_shape[2]
            ));
        }
        if self.precision == Precision::Quantized && self.input_quantization.is_none() {
            return Err("quantized models require input_quantization".into());
        }
        for q in [self.input_quantization, self.output_quantization]
            .into_iter()
            .flatten()
        {
            if !(q.scale.is_finite() && q.scale > 0.0) || !(0..=255).contains(&q.zero_point) {
                return Err("quantization scale must be > 0 and zero_point in 0..=255".into());
            }
        }
        Ok(())
    }

    pub fn model_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.model_file)
    }

    pub fn label_table(&self) -> LabelTable {
        LabelTable {
            version: self.label_version.clone(),
            labels: self.labels.clone(),
            display_names: self.display_names.clone(),
        }
    }

    /// Compare the model file against `sha256`, when one is declared.
    pub fn verify_checksum(&self, dir: &Path) -> Result<()> {
        let Some(expected) = self.sha256.as_deref() else {
            return Ok(());
        };
        let path = self.model_path(dir);
        let found = sha256_file(&path)?;
        if !found.eq_ignore_ascii_case(expected.trim()) {
            return Err(TussisError::ChecksumMismatch {
                path,
                expected: expected.to_string(),
                found,
            });
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TussisError::ModelNotFound {
            path: path.to_path_buf(),
        },
        _ => TussisError::Io(e),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Versioned index → label mapping shared by every ensemble member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelTable {
    pub version: String,
    pub labels: Vec<String>,
    pub display_names: Option<Vec<String>>,
}

impl LabelTable {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Display name when the manifest defines one, otherwise the raw label.
    pub fn display(&self, index: usize) -> Option<&str> {
        self.display_names
            .as_ref()
            .and_then(|names| names.get(index))
            .map(String::as_str)
            .or_else(|| self.label(index))
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Same class order and version; display names may differ.
    pub fn same_space(&self, other: &LabelTable) -> bool {
        self.version == other.version && self.labels == other.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: [&str; 4] = ["asthma", "covid", "healthy", "tuberculosis"];

    fn write_artifact(dir: &Path, manifest: &str, model: &[u8]) {
        fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        fs::write(dir.join("model.onnx"), model).unwrap();
    }

    #[test]
    fn minimal_manifest_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), r#"{ "labels": ["a", "b"] }"#, b"weights");
        let m = ModelManifest::load(dir.path()).unwrap();
        assert_eq!(m.output, OutputKind::Logits);
        assert_eq!(m.layout, TensorLayout::Nhwc);
        assert_eq!(m.input_shape, [240, 240, 3]);
        assert_eq!(m.model_path(dir.path()), dir.path().join("model.onnx"));
    }

    #[test]
    fn missing_manifest_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ModelManifest::load(dir.path()),
            Err(TussisError::ModelNotFound { .. })
        ));
    }

    #[test]
    fn invalid_manifests_are_rejected() {
        let cases = [
            r#"{ "labels": [] }"#,
            r#"{ "labels": ["a", "a"] }"#,
            r#"{ "labels": ["a", "b"], "display_names": ["x"] }"#,
            r#"{ "labels": ["a"], "input_shape": [240, 240, 1] }"#,
            r#"{ "labels": ["a"], "precision": "quantized" }"#,
            r#"{ "labels": ["a"], "output": "softmax" }"#,
        ];
        for json in cases {
            let dir = tempfile::tempdir().unwrap();
            write_artifact(dir.path(), json, b"");
            assert!(
                matches!(
                    ModelManifest::load(dir.path()),
                    Err(TussisError::ManifestInvalid { .. })
                ),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn checksum_is_verified_when_declared() {
        let dir = tempfile::tempdir().unwrap();
        // sha256("abc")
        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let json = format!(r#"{{ "labels": ["a"], "sha256": "{}" }}"#, digest.to_uppercase());
        write_artifact(dir.path(), &json, b"abc");
        let m = ModelManifest::load(dir.path()).unwrap();
        m.verify_checksum(dir.path()).unwrap();

        fs::write(dir.path().join("model.onnx"), b"abd").unwrap();
        assert!(matches!(
            m.verify_checksum(dir.path()),
            Err(TussisError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn label_table_prefers_display_names() {
        let mut m = ModelManifest::with_labels(LABELS);
        assert_eq!(m.label_table().display(1), Some("covid"));
        m.display_names = Some(
            ["Hen suyễn", "COVID-19", "Khỏe mạnh", "Lao"]
                .map(String::from)
                .to_vec(),
        );
        let table = m.label_table();
        assert_eq!(table.display(1), Some("COVID-19"));
        assert_eq!(table.label(1), Some("covid"));
        assert_eq!(table.index_of("healthy"), Some(2));
        assert_eq!(table.display(9), None);
    }

    #[test]
    fn label_spaces_compare_order_and_version() {
        let a = ModelManifest::with_labels(LABELS).label_table();
        let mut reordered = a.clone();
        reordered.labels.swap(0, 1);
        let mut bumped = a.clone();
        bumped.version = "2".into();
        let mut renamed = a.clone();
        renamed.display_names = Some(vec!["w".into(), "x".into(), "y".into(), "z".into()]);

        assert!(!a.same_space(&reordered));
        assert!(!a.same_space(&bumped));
        assert!(a.same_space(&renamed));
    }

    #[test]
    fn quant_params_round_trip_within_one_step() {
        let q = QuantParams {
            scale: 2.0 / 255.0,
            zero_point: 128,
        };
        for v in [-1.0f32, -0.5, 0.0, 0.3, 0.99] {
            assert!((q.dequantize(q.quantize(v)) - v).abs() <= q.scale);
        }
        assert_eq!(q.quantize(50.0), 255);
        assert_eq!(q.quantize(-50.0), 0);
    }
}
