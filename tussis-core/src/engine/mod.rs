//! `TussisEngine`: one classification request, end to end.
//!
//! ## Lifecycle
//!
//! ```text
//! ModelRegistry::load_*()     → models loaded, warmed up, validated
//!     └─► TussisEngine::new() → stages + ensemble built once
//!         └─► classify_*()    → any number of concurrent requests
//!             └─► drop        → models released
//! ```
//!
//! ## Threading
//!
//! After construction the engine is read-only: every `classify_*` call owns
//! its waveform and intermediates and only borrows the shared stage state.
//! Share it as `Arc<TussisEngine>` across threads. The async entry points
//! move the CPU-bound work onto tokio's blocking pool.

pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::audio::Waveform;
use crate::config::PipelineConfig;
use crate::error::{Result, TussisError};
use crate::inference::ensemble::{ClassifierEnsemble, EnsembleMode, EnsembleOptions};
use crate::inference::registry::{LoadFailure, ModelRegistry, RegistryState};
use crate::inference::LabelTable;
use crate::report::{
    CallDiagnostics, Classification, Outcome, PipelineWarning, ResultFormatter,
};

pub use pipeline::Prepared;
use pipeline::{elapsed_ms, Stages};

/// Request counters, reset with `reset_counters()`.
pub struct EngineCounters {
    pub requests: AtomicUsize,
    pub classified: AtomicUsize,
    pub too_short: AtomicUsize,
    pub insufficient_samples: AtomicUsize,
    pub failures: AtomicUsize,
    pub models_excluded: AtomicUsize,
}

impl Default for EngineCounters {
    fn default() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            classified: AtomicUsize::new(0),
            too_short: AtomicUsize::new(0),
            insufficient_samples: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            models_excluded: AtomicUsize::new(0),
        }
    }
}

impl EngineCounters {
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.classified.store(0, Ordering::Relaxed);
        self.too_short.store(0, Ordering::Relaxed);
        self.insufficient_samples.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.models_excluded.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            too_short: self.too_short.load(Ordering::Relaxed),
            insufficient_samples: self.insufficient_samples.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            models_excluded: self.models_excluded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub requests: usize,
    pub classified: usize,
    pub too_short: usize,
    pub insufficient_samples: usize,
    pub failures: usize,
    pub models_excluded: usize,
}

/// The top-level engine handle.
///
/// `TussisEngine` is `Send + Sync`; counters are the only mutable state and
/// they are atomics.
pub struct TussisEngine {
    config: PipelineConfig,
    stages: Stages,
    ensemble: ClassifierEnsemble,
    formatter: ResultFormatter,
    registry_state: RegistryState,
    load_failures: Vec<LoadFailure>,
    /// Monotonically increasing request id, used in log spans.
    seq: AtomicU64,
    counters: EngineCounters,
}

impl TussisEngine {
    /// Build every stage from `config` and serve the models in `registry`.
    ///
    /// # Errors
    /// `Config` when the configuration is invalid; `ModelsUnavailable` or
    /// `LabelSpaceMismatch` from ensemble construction.
    pub fn new(config: PipelineConfig, registry: ModelRegistry) -> Result<Self> {
        config.validate()?;
        let ensemble = ClassifierEnsemble::new(
            registry.models().to_vec(),
            EnsembleOptions::from_config(&config),
        )?;
        let mode = ensemble.mode();

        info!("=== Tussis engine ready ===");
        info!("  mode: {:?}", mode);
        info!(
            "  models: {:?}",
            ensemble.members().iter().map(|m| m.name()).collect::<Vec<_>>()
        );
        info!("  classes: {:?}", ensemble.labels().labels);
        info!(
            "  features: {} Hz, n_fft={}, hop={}, n_mels={}, target={}x{}, {:?}",
            config.sample_rate,
            config.n_fft,
            config.hop_length,
            config.n_mels,
            config.target_shape.height,
            config.target_shape.width,
            config.pixel_normalization
        );
        if registry.state() == RegistryState::Degraded {
            warn!(
                failed = registry.failures().len(),
                "engine is running degraded"
            );
        }

        Ok(Self {
            stages: Stages::new(&config),
            formatter: ResultFormatter::new(config.include_breakdown),
            registry_state: registry.state(),
            load_failures: registry.failures().to_vec(),
            config,
            ensemble,
            seq: AtomicU64::new(0),
            counters: EngineCounters::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn labels(&self) -> &LabelTable {
        self.ensemble.labels()
    }

    pub fn mode(&self) -> EnsembleMode {
        self.ensemble.mode()
    }

    pub fn registry_state(&self) -> RegistryState {
        self.registry_state
    }

    /// Models that failed to load under the best-effort policy.
    pub fn load_failures(&self) -> &[LoadFailure] {
        &self.load_failures
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Run the feature stages only. Useful for inspecting what the models see.
    pub fn prepare(&self, wave: Waveform) -> Result<(Prepared, CallDiagnostics)> {
        let mut diagnostics = CallDiagnostics::default();
        let prepared = self.stages.prepare(wave, &mut diagnostics)?;
        Ok((prepared, diagnostics))
    }

    pub fn classify_waveform(&self, wave: Waveform) -> Result<Classification> {
        let request = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("classify", request);
        let _enter = span.enter();

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let result = self.run(wave);
        match &result {
            Ok(classification) => self.count_outcome(classification),
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "classification failed");
            }
        }
        result
    }

    /// Classify raw interleaved samples.
    pub fn classify_samples(
        &self,
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Classification> {
        let wave = match Waveform::from_interleaved(samples, channels, sample_rate) {
            Ok(wave) => wave,
            Err(e) => return Err(self.reject(e)),
        };
        self.classify_waveform(wave)
    }

    /// Classify a WAV file.
    pub fn classify_file(&self, path: &Path) -> Result<Classification> {
        let wave = match Waveform::load_wav(path) {
            Ok(wave) => wave,
            Err(e) => return Err(self.reject(e)),
        };
        self.classify_waveform(wave)
    }

    /// `classify_file` on the blocking pool, bounded by `request_timeout_ms`.
    ///
    /// On timeout the caller gets `Timeout`; the blocking task still runs to
    /// completion and its result is discarded.
    pub async fn classify_file_async(self: &Arc<Self>, path: PathBuf) -> Result<Classification> {
        self.offload(move |engine| engine.classify_file(&path)).await
    }

    pub async fn classify_waveform_async(self: &Arc<Self>, wave: Waveform) -> Result<Classification> {
        self.offload(move |engine| engine.classify_waveform(wave)).await
    }

    async fn offload<F>(self: &Arc<Self>, work: F) -> Result<Classification>
    where
        F: FnOnce(&TussisEngine) -> Result<Classification> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || work(&engine));
        let joined = match self.config.request_timeout_ms {
            Some(after_ms) => tokio::time::timeout(Duration::from_millis(after_ms), task)
                .await
                .map_err(|_| {
                    warn!(after_ms, "classification timed out");
                    TussisError::Timeout { after_ms }
                })?,
            None => task.await,
        };
        joined.map_err(|e| TussisError::Other(anyhow::anyhow!("classification task failed: {e}")))?
    }

    fn run(&self, wave: Waveform) -> Result<Classification> {
        let mut diagnostics = CallDiagnostics::default();
        let tensor = match self.stages.prepare(wave, &mut diagnostics)? {
            Prepared::Tensor(tensor) => tensor,
            Prepared::Unclassifiable(reason) => {
                info!(%reason, "clip not classifiable");
                return Ok(Classification {
                    outcome: Outcome::Unclassifiable { reason },
                    diagnostics,
                });
            }
        };

        let started = Instant::now();
        let decision = self.ensemble.classify(&tensor)?;
        diagnostics.timings.inference_ms = elapsed_ms(started);

        for (model, reason) in &decision.excluded {
            self.counters.models_excluded.fetch_add(1, Ordering::Relaxed);
            diagnostics.warn(PipelineWarning::ModelExcluded {
                model: model.clone(),
                reason: reason.clone(),
            });
        }

        let report = self.formatter.format(&decision, self.ensemble.labels());
        diagnostics.class_index = Some(decision.index);
        diagnostics.label = self.ensemble.labels().label(decision.index).map(str::to_string);
        diagnostics.votes = decision.votes;
        diagnostics.tied = decision.tied;

        info!(
            label = diagnostics.label.as_deref().unwrap_or("?"),
            confidence = %report.confidence,
            tied = diagnostics.tied,
            inference_ms = diagnostics.timings.inference_ms,
            "clip classified"
        );
        Ok(Classification {
            outcome: Outcome::Classified(report),
            diagnostics,
        })
    }

    fn count_outcome(&self, classification: &Classification) {
        use crate::report::UnclassifiableReason as R;
        let counter = match classification.reason() {
            None => &self.counters.classified,
            Some(R::TooShort { .. }) => &self.counters.too_short,
            Some(R::InsufficientSamples { .. }) => &self.counters.insufficient_samples,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that failed before it reached the pipeline.
    fn reject(&self, e: TussisError) -> TussisError {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %e, "audio rejected");
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::denoise::DenoiseMode;
    use crate::inference::ensemble::DegradedPolicy;
    use crate::inference::stub::StubClassifier;
    use crate::inference::{ModelHandle, ModelManifest};
    use crate::report::UnclassifiableReason;

    const LABELS: [&str; 4] = ["asthma", "covid", "healthy", "tuberculosis"];

    fn config() -> PipelineConfig {
        PipelineConfig {
            denoise: DenoiseMode::None,
            ..PipelineConfig::default()
        }
    }

    fn manifest() -> ModelManifest {
        let mut m = ModelManifest::with_labels(LABELS);
        m.display_names = Some(
            ["Hen suyễn", "COVID-19", "Khỏe mạnh", "Lao"]
                .map(String::from)
                .to_vec(),
        );
        m
    }

    fn engine(config: PipelineConfig, stubs: Vec<StubClassifier>) -> TussisEngine {
        let handles = stubs.into_iter().map(ModelHandle::new).collect();
        let registry = ModelRegistry::from_handles(handles, &config).unwrap();
        TussisEngine::new(config, registry).unwrap()
    }

    fn noise(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (((i * 7_919 + 13) % 1_009) as f32 / 1_009.0) - 0.5)
            .collect()
    }

    #[test]
    fn single_model_report_and_diagnostics() {
        let engine = engine(
            config(),
            vec![StubClassifier::fixed("b0", manifest(), vec![0.0, 3.0, 1.0, 0.0])],
        );
        let result = engine.classify_samples(noise(32_000), 1, 16_000).unwrap();
        let report = result.report().expect("classified");
        assert_eq!(report.predicted_label, "COVID-19");
        assert!(report.confidence.ends_with('%'));
        assert_eq!(report.per_class_breakdown.as_ref().map(|b| b.len()), Some(4));
        assert_eq!(result.diagnostics.class_index, Some(1));
        assert_eq!(result.diagnostics.label.as_deref(), Some("covid"));
        assert_eq!(result.diagnostics.votes.len(), 1);
        assert_eq!(engine.mode(), EnsembleMode::Single);
    }

    #[test]
    fn too_short_never_reaches_a_model() {
        let stub = StubClassifier::fixed("b0", manifest(), vec![1.0, 0.0, 0.0, 0.0]);
        let calls = stub.clone();
        let engine = engine(config(), vec![stub]);
        let before = calls.calls();
        let result = engine.classify_samples(noise(8_000), 1, 16_000).unwrap();
        assert!(matches!(
            result.reason(),
            Some(UnclassifiableReason::TooShort { .. })
        ));
        assert_eq!(calls.calls(), before);
        assert_eq!(engine.counters().too_short, 1);
    }

    #[test]
    fn stereo_input_is_mixed_down() {
        let engine = engine(
            config(),
            vec![StubClassifier::fixed("b0", manifest(), vec![0.0, 0.0, 5.0, 0.0])],
        );
        let stereo: Vec<f32> = noise(20_000).into_iter().flat_map(|s| [s, -s * 0.5]).collect();
        let result = engine.classify_samples(stereo, 2, 16_000).unwrap();
        assert_eq!(result.report().unwrap().predicted_label, "Khỏe mạnh");
        assert!((result.diagnostics.duration_s - 1.25).abs() < 1e-6);
    }

    #[test]
    fn invalid_audio_is_counted_as_failure() {
        let engine = engine(
            config(),
            vec![StubClassifier::fixed("b0", manifest(), vec![0.0; 4])],
        );
        assert!(matches!(
            engine.classify_samples(vec![0.1, 0.2, 0.3], 2, 16_000),
            Err(TussisError::InvalidAudio(_))
        ));
        let counters = engine.counters();
        assert_eq!(counters.requests, 1);
        assert_eq!(counters.failures, 1);
        engine.reset_counters();
        assert_eq!(engine.counters().requests, 0);
    }

    #[test]
    fn excluded_member_surfaces_as_warning() {
        let config = PipelineConfig {
            degraded_policy: DegradedPolicy::BestEffort,
            ..config()
        };
        let engine = engine(
            config,
            vec![
                StubClassifier::fixed("b0", manifest(), vec![0.0, 0.0, 0.0, 4.0]),
                StubClassifier::failing("r50", manifest(), "runtime error"),
                StubClassifier::fixed("b3", manifest(), vec![0.0, 0.0, 0.0, 2.0]),
            ],
        );
        let result = engine.classify_samples(noise(20_000), 1, 16_000).unwrap();
        assert_eq!(result.report().unwrap().predicted_label, "Lao");
        assert!(result
            .diagnostics
            .warnings
            .iter()
            .any(|w| matches!(w, PipelineWarning::ModelExcluded { model, .. } if model == "r50")));
        assert_eq!(engine.counters().models_excluded, 1);
    }

    #[test]
    fn prepare_exposes_the_model_input() {
        let engine = engine(
            config(),
            vec![StubClassifier::fixed("b0", manifest(), vec![0.0; 4])],
        );
        let (prepared, diagnostics) = engine
            .prepare(Waveform::mono(noise(24_000), 16_000).unwrap())
            .unwrap();
        let Prepared::Tensor(tensor) = prepared else {
            panic!("expected tensor");
        };
        assert_eq!(tensor.shape(), [240, 240, 3]);
        assert!(diagnostics.frames.is_some());
        assert_eq!(engine.counters().requests, 0);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let good = config();
        let registry = ModelRegistry::from_handles(
            vec![ModelHandle::new(StubClassifier::fixed("b0", manifest(), vec![0.0; 4]))],
            &good,
        )
        .unwrap();
        let bad = PipelineConfig { n_mels: 0, ..good };
        assert!(matches!(
            TussisEngine::new(bad, registry),
            Err(TussisError::Config(_))
        ));
    }
}
