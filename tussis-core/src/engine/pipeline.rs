//! Feature-extraction stages for one request.
//!
//! ## Stages (strictly in order)
//!
//! ```text
//! 1. Mono mix + peak normalization
//! 2. Sample-rate check       → warning, or resample when enabled
//! 3. Duration check          → Unclassifiable(TooShort)
//! 4. Denoise                 (same length out as in)
//! 5. Silence trim
//! 6. Mel spectrogram         → Unclassifiable(InsufficientSamples)
//! 7. Shape reconciliation    → FixedTensor
//! ```
//!
//! Every stage only borrows the precomputed state in `Stages`, so one
//! instance serves all concurrent requests.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::audio::denoise::{self, Denoiser};
use crate::audio::resample::RateConverter;
use crate::audio::{peak, Waveform};
use crate::config::PipelineConfig;
use crate::dsp::reshape::{FixedTensor, ShapeReconciler};
use crate::dsp::spectral::SpectralAnalyzer;
use crate::dsp::trim::SilenceTrimmer;
use crate::error::{Result, TussisError};
use crate::report::{CallDiagnostics, PipelineWarning, UnclassifiableReason};

/// Output of the feature-extraction stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Tensor(FixedTensor),
    Unclassifiable(UnclassifiableReason),
}

pub(crate) struct Stages {
    sample_rate: u32,
    min_duration_s: f32,
    resample_mismatched: bool,
    denoiser: Arc<dyn Denoiser>,
    trimmer: SilenceTrimmer,
    analyzer: SpectralAnalyzer,
    reconciler: ShapeReconciler,
}

impl Stages {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        Self::with_denoiser(config, denoise::from_mode(config.denoise))
    }

    pub(crate) fn with_denoiser(config: &PipelineConfig, denoiser: Arc<dyn Denoiser>) -> Self {
        Self {
            sample_rate: config.sample_rate,
            min_duration_s: config.min_duration_s,
            resample_mismatched: config.resample_mismatched,
            denoiser,
            trimmer: SilenceTrimmer::new(
                config.silence_threshold_db,
                config.trim_frame_length,
                config.trim_hop_length,
            ),
            analyzer: SpectralAnalyzer::new(
                config.sample_rate,
                config.n_fft,
                config.hop_length,
                config.n_mels,
                config.top_db,
            ),
            reconciler: ShapeReconciler::new(
                config.target_shape,
                config.pixel_normalization,
                config.top_db,
            ),
        }
    }

    pub(crate) fn prepare(&self, wave: Waveform, diag: &mut CallDiagnostics) -> Result<Prepared> {
        // 1.
        let started = Instant::now();
        let mut wave = wave.into_mono();
        diag.source_sample_rate = wave.sample_rate();
        diag.duration_s = wave.duration_secs() as f32;

        // 2.
        if wave.sample_rate() != self.sample_rate {
            let declared = wave.sample_rate();
            if self.resample_mismatched {
                let mut converter = RateConverter::new(declared, self.sample_rate)?;
                let resampled = converter.process_clip(wave.samples())?;
                wave = wave.with_samples(resampled, self.sample_rate);
                diag.warn(PipelineWarning::Resampled {
                    from: declared,
                    to: self.sample_rate,
                });
            } else {
                warn!(declared, expected = self.sample_rate, "sample rate mismatch; analysing as-is");
                diag.warn(PipelineWarning::SampleRateMismatch {
                    declared,
                    expected: self.sample_rate,
                });
            }
        }
        // After resampling: interpolation can overshoot the unit peak.
        let wave = wave.normalized();
        diag.timings.prepare_ms = elapsed_ms(started);

        // 3.
        let duration_s = wave.duration_secs() as f32;
        if duration_s < self.min_duration_s {
            return Ok(Prepared::Unclassifiable(UnclassifiableReason::TooShort {
                duration_s,
                min_duration_s: self.min_duration_s,
            }));
        }
        if peak(wave.samples()) == 0.0 {
            diag.warn(PipelineWarning::SilentInput);
        }

        // 4.
        let started = Instant::now();
        let denoised = self.denoiser.denoise(wave.samples(), wave.sample_rate());
        if denoised.len() != wave.samples().len() {
            return Err(TussisError::Other(anyhow::anyhow!(
                "denoiser returned {} samples for {} input samples",
                denoised.len(),
                wave.samples().len()
            )));
        }
        if denoised.iter().any(|s| !s.is_finite()) {
            return Err(TussisError::Other(anyhow::anyhow!(
                "denoiser produced non-finite samples"
            )));
        }
        diag.timings.denoise_ms = elapsed_ms(started);

        // 5.
        let started = Instant::now();
        let trimmed = self.trimmer.trim(&denoised);
        diag.trimmed_samples = Some(trimmed.len());
        diag.timings.trim_ms = elapsed_ms(started);

        // 6.
        let started = Instant::now();
        let Some(spectrogram) = self.analyzer.analyze(trimmed) else {
            return Ok(Prepared::Unclassifiable(
                UnclassifiableReason::InsufficientSamples {
                    samples: trimmed.len(),
                    n_fft: self.analyzer.n_fft(),
                },
            ));
        };
        diag.frames = Some(spectrogram.ncols());
        diag.timings.spectral_ms = elapsed_ms(started);

        // 7.
        let started = Instant::now();
        let tensor = self.reconciler.reconcile(&spectrogram);
        diag.timings.reshape_ms = elapsed_ms(started);

        debug!(
            samples = denoised.len(),
            trimmed = trimmed.len(),
            frames = spectrogram.ncols(),
            shape = ?tensor.shape(),
            "features ready"
        );
        Ok(Prepared::Tensor(tensor))
    }
}

pub(crate) fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::denoise::DenoiseMode;
    use crate::config::TargetShape;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> PipelineConfig {
        PipelineConfig {
            denoise: DenoiseMode::None,
            ..PipelineConfig::default()
        }
    }

    fn tone(len: usize, sample_rate: u32) -> Waveform {
        let samples = (0..len)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin())
            .collect();
        Waveform::mono(samples, sample_rate).unwrap()
    }

    struct Shrinking;

    /// Passes the signal through and remembers its peak.
    #[derive(Default)]
    struct PeakRecorder(AtomicU32);

    impl Denoiser for PeakRecorder {
        fn denoise(&self, samples: &[f32], _sample_rate: u32) -> Vec<f32> {
            self.0.store(peak(samples).to_bits(), Ordering::SeqCst);
            samples.to_vec()
        }
    }

    impl Denoiser for Shrinking {
        fn denoise(&self, samples: &[f32], _sample_rate: u32) -> Vec<f32> {
            samples[1..].to_vec()
        }
    }

    #[test]
    fn short_clip_stops_before_feature_extraction() {
        let mut diag = CallDiagnostics::default();
        let prepared = Stages::new(&config())
            .prepare(tone(8_000, 16_000), &mut diag)
            .unwrap();
        assert_eq!(
            prepared,
            Prepared::Unclassifiable(UnclassifiableReason::TooShort {
                duration_s: 0.5,
                min_duration_s: 1.0
            })
        );
        assert!(diag.frames.is_none());
    }

    #[test]
    fn tensor_matches_target_shape() {
        let mut diag = CallDiagnostics::default();
        let prepared = Stages::new(&config())
            .prepare(tone(32_000, 16_000), &mut diag)
            .unwrap();
        let Prepared::Tensor(tensor) = prepared else {
            panic!("expected tensor");
        };
        assert_eq!(tensor.shape(), [240, 240, 3]);
        assert!(tensor.is_finite());
        // 59 trim frames, so the kept span ends at 59 * 512.
        assert_eq!(diag.trimmed_samples, Some(30_208));
        assert_eq!(diag.frames, Some(1 + (30_208 - 2048) / 512));
        assert!(diag.warnings.is_empty());
    }

    #[test]
    fn trimmed_below_one_frame_is_insufficient() {
        let config = PipelineConfig {
            min_duration_s: 0.05,
            ..config()
        };
        let mut diag = CallDiagnostics::default();
        let prepared = Stages::new(&config)
            .prepare(tone(2_000, 16_000), &mut diag)
            .unwrap();
        assert_eq!(
            prepared,
            Prepared::Unclassifiable(UnclassifiableReason::InsufficientSamples {
                samples: 2_000,
                n_fft: 2048
            })
        );
    }

    #[test]
    fn mismatched_rate_is_a_warning_not_an_error() {
        let mut diag = CallDiagnostics::default();
        let prepared = Stages::new(&config())
            .prepare(tone(44_100, 44_100), &mut diag)
            .unwrap();
        assert!(matches!(prepared, Prepared::Tensor(_)));
        assert_eq!(
            diag.warnings,
            vec![PipelineWarning::SampleRateMismatch {
                declared: 44_100,
                expected: 16_000
            }]
        );
        assert_eq!(diag.source_sample_rate, 44_100);
    }

    #[test]
    fn mismatched_rate_is_resampled_when_enabled() {
        let config = PipelineConfig {
            resample_mismatched: true,
            ..config()
        };
        let mut diag = CallDiagnostics::default();
        Stages::new(&config)
            .prepare(tone(48_000, 48_000), &mut diag)
            .unwrap();
        assert_eq!(
            diag.warnings,
            vec![PipelineWarning::Resampled {
                from: 48_000,
                to: 16_000
            }]
        );
        assert!(diag.trimmed_samples.is_some_and(|n| n <= 16_000));
        assert!(diag.frames.is_some());
    }

    #[test]
    fn resampled_clip_keeps_unit_peak() {
        let config = PipelineConfig {
            resample_mismatched: true,
            ..config()
        };
        // A full-scale square wave makes the interpolator ring past 1.0.
        let square: Vec<f32> = (0..88_200)
            .map(|i| if (i / 50) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let recorder = Arc::new(PeakRecorder::default());
        let stages = Stages::with_denoiser(&config, recorder.clone());
        let mut diag = CallDiagnostics::default();
        stages
            .prepare(Waveform::mono(square, 44_100).unwrap(), &mut diag)
            .unwrap();
        let seen = f32::from_bits(recorder.0.load(Ordering::SeqCst));
        assert!(seen > 0.99 && seen <= 1.0, "peak after resampling = {seen}");
    }

    #[test]
    fn silent_clip_is_flagged_and_maps_to_the_floor() {
        let config = PipelineConfig {
            target_shape: TargetShape {
                height: 128,
                width: 64,
            },
            ..config()
        };
        let mut diag = CallDiagnostics::default();
        let prepared = Stages::new(&config)
            .prepare(Waveform::mono(vec![0.0; 20_000], 16_000).unwrap(), &mut diag)
            .unwrap();
        let Prepared::Tensor(tensor) = prepared else {
            panic!("silence is still classifiable");
        };
        assert!(tensor.is_finite());
        // Default `tf` scaling: silence sits at the bottom of [-1, 1].
        assert!(tensor.view().iter().all(|&v| (v + 1.0).abs() < 1e-6));
        assert_eq!(diag.warnings, vec![PipelineWarning::SilentInput]);
        assert_eq!(diag.trimmed_samples, Some(20_000));
    }

    #[test]
    fn denoiser_that_changes_length_is_rejected() {
        let stages = Stages::with_denoiser(&config(), Arc::new(Shrinking));
        let mut diag = CallDiagnostics::default();
        assert!(matches!(
            stages.prepare(tone(20_000, 16_000), &mut diag),
            Err(TussisError::Other(_))
        ));
    }
}
