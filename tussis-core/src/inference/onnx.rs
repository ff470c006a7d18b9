//! Image-classifier backend via the `ort` crate.
//!
//! Targets single-input, single-output exports of 2-D CNN classifiers
//! (EfficientNet / ResNet families):
//! - NHWC graphs (Keras/tf2onnx): input `[1, H, W, 3]`
//! - NCHW graphs (PyTorch):       input `[1, 3, H, W]`
//! - output `[1, n_classes]`, logits or probabilities per the manifest
//!
//! Quantized exports take a `u8` input tensor; values are affine-quantized
//! with the manifest's `input_quantization`, and a `u8` output is
//! dequantized with `output_quantization`.

use std::path::Path;

use ndarray::{Array4, Axis};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::dsp::reshape::FixedTensor;
use crate::error::{Result, TussisError};
use crate::inference::manifest::{ModelManifest, Precision, TensorLayout};
use crate::inference::{Classifier, ScoreVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrtExecutionPreference {
    Auto,
    Cpu,
    DirectML,
}

impl OrtExecutionPreference {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "dml" | "directml" => Self::DirectML,
            _ => Self::Auto,
        }
    }
}

/// Session construction knobs shared by every model in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxOptions {
    /// `auto`, `cpu` or `directml`.
    pub ep: String,
    pub intra_threads: Option<usize>,
}

impl Default for OnnxOptions {
    fn default() -> Self {
        Self {
            ep: "auto".into(),
            intra_threads: None,
        }
    }
}

impl OnnxOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ep: config.ort_ep.clone(),
            intra_threads: config.ort_intra_threads,
        }
    }
}

fn create_session(model_path: &Path, options: &OnnxOptions) -> Result<Session> {
    let pref = OrtExecutionPreference::parse(&options.ep);
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = options
        .intra_threads
        .unwrap_or_else(|| logical_cores.clamp(2, 12))
        .clamp(1, 32);

    let mut builder = SessionBuilder::new()
        .map_err(|e| TussisError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| TussisError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| TussisError::OnnxSession(e.to_string()))?;
    debug!(intra_threads, logical_cores, "ONNX session threading configured");

    #[cfg(target_os = "windows")]
    {
        builder = match pref {
            OrtExecutionPreference::Cpu => {
                info!("ONNX EP preference=cpu");
                builder
                    .with_execution_providers([ep::CPU::default().build()])
                    .map_err(|e| TussisError::OnnxSession(e.to_string()))?
            }
            OrtExecutionPreference::DirectML => {
                info!("ONNX EP preference=directml (strict)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .error_on_failure(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(|e| TussisError::OnnxSession(e.to_string()))?
            }
            OrtExecutionPreference::Auto => {
                info!("ONNX EP preference=auto (directml -> cpu)");
                builder
                    .with_execution_providers([
                        ep::DirectML::default()
                            .with_device_id(0)
                            .build()
                            .fail_silently(),
                        ep::CPU::default().build(),
                    ])
                    .map_err(|e| TussisError::OnnxSession(e.to_string()))?
            }
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        if pref == OrtExecutionPreference::DirectML {
            warn!("ort_ep=directml requested on non-Windows host; using CPU EP");
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(|e| TussisError::OnnxSession(e.to_string()))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| TussisError::OnnxSession(e.to_string()))
}

fn resolve_name(candidates: &[String], preferred: Option<&str>) -> Option<String> {
    match preferred {
        Some(name) => candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .cloned(),
        None => candidates.first().cloned(),
    }
}

/// One ONNX model artifact.
///
/// `Session::run` needs exclusive access, so calls on the same model are
/// serialised through a `parking_lot::Mutex`. Different models run in
/// parallel.
pub struct OnnxClassifier {
    name: String,
    manifest: ModelManifest,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    /// Load `<dir>/manifest.json` and the model file it names.
    ///
    /// # Errors
    /// `ModelNotFound`, `ManifestInvalid`, `ChecksumMismatch`, `OnnxSession`,
    /// or `IncompatibleModel` when the graph's input disagrees with the manifest.
    pub fn load(dir: &Path, options: &OnnxOptions) -> Result<Self> {
        let manifest = ModelManifest::load(dir)?;
        let model_path = manifest.model_path(dir);
        if !model_path.exists() {
            return Err(TussisError::ModelNotFound { path: model_path });
        }
        manifest.verify_checksum(dir)?;

        let name = manifest.name.clone().unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string())
        });
        let size_mb = std::fs::metadata(&model_path)
            .map(|m| m.len() as f64 / 1_048_576.0)
            .unwrap_or(0.0);

        info!("=== Tussis model startup report: {name} ===");
        info!("  path: {:?}", model_path);
        info!("  size: {:.2} MB", size_mb);
        info!("  classes: {:?} (v{})", manifest.labels, manifest.label_version);
        info!(
            "  input: {:?} {:?} {:?}",
            manifest.input_shape, manifest.layout, manifest.precision
        );

        let session = create_session(&model_path, options)?;
        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!("  inputs: {:?}", input_names);
        info!("  outputs: {:?}", output_names);

        let incompatible = |reason: String| TussisError::IncompatibleModel {
            model: name.clone(),
            reason,
        };
        let input_name = resolve_name(&input_names, manifest.input_name.as_deref())
            .ok_or_else(|| incompatible(format!("input tensor not found in {input_names:?}")))?;
        let output_name = resolve_name(&output_names, manifest.output_name.as_deref())
            .ok_or_else(|| incompatible(format!("output tensor not found in {output_names:?}")))?;

        if let Some(shape) = session
            .inputs()
            .iter()
            .find(|i| i.name() == input_name)
            .and_then(|i| i.dtype().tensor_shape())
        {
            let declared: Vec<i64> = (0..shape.len()).map(|i| shape[i]).collect();
            let [h, w, c] = manifest.input_shape;
            let expected: [i64; 4] = match manifest.layout {
                TensorLayout::Nhwc => [1, h as i64, w as i64, c as i64],
                TensorLayout::Nchw => [1, c as i64, h as i64, w as i64],
            };
            let matches = declared.len() == 4
                && declared
                    .iter()
                    .zip(expected)
                    .all(|(&d, e)| d <= 0 || d == e);
            if !matches {
                return Err(incompatible(format!(
                    "graph input {declared:?} does not match manifest {expected:?}"
                )));
            }
        }

        Ok(Self {
            name,
            manifest,
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }

    fn batch(&self, input: &FixedTensor) -> Array4<f32> {
        let view = input.view();
        let view = match self.manifest.layout {
            TensorLayout::Nhwc => view,
            TensorLayout::Nchw => view.permuted_axes([2, 0, 1]),
        };
        view.insert_axis(Axis(0)).as_standard_layout().into_owned()
    }

    fn session_err(&self, e: impl std::fmt::Display) -> TussisError {
        TussisError::Inference {
            model: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

impl Classifier for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    fn warm_up(&self) -> Result<()> {
        let [h, w, _] = self.manifest.input_shape;
        let started = std::time::Instant::now();
        let scores = self.infer(&FixedTensor::zeros(h, w))?;
        info!(
            model = %self.name,
            classes = scores.len(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0,
            "warm-up inference complete"
        );
        Ok(())
    }

    fn infer(&self, input: &FixedTensor) -> Result<ScoreVector> {
        crate::inference::check_input_shape(&self.name, self.manifest.input_shape, input)?;
        let batch = self.batch(input);

        let value: SessionInputValue<'_> = match (self.manifest.precision, self.manifest.input_quantization) {
            (Precision::Quantized, Some(q)) => Value::from_array(batch.mapv(|v| q.quantize(v)))
                .map_err(|e: ort::Error| self.session_err(e))?
                .into(),
            _ => Value::from_array(batch)
                .map_err(|e: ort::Error| self.session_err(e))?
                .into(),
        };
        let inputs: Vec<(String, SessionInputValue<'_>)> = vec![(self.input_name.clone(), value)];

        let mut session = self.session.lock();
        let outputs = session.run(inputs).map_err(|e| self.session_err(e))?;
        let output = outputs
            .get(self.output_name.as_str())
            .unwrap_or(&outputs[0]);

        let values = match self.manifest.output_quantization {
            Some(q) => {
                let (_, data) = output
                    .try_extract_tensor::<u8>()
                    .map_err(|e| self.session_err(e))?;
                data.iter().map(|&b| q.dequantize(b)).collect()
            }
            None => {
                let (_, data) = output
                    .try_extract_tensor::<f32>()
                    .map_err(|e| self.session_err(e))?;
                data.to_vec()
            }
        };
        Ok(ScoreVector::new(values, self.manifest.output))
    }
}
