//! Noise reduction applied between normalization and trimming.
//!
//! The pipeline only relies on the `Denoiser` contract: same length out as in,
//! no NaN. `SpectralGate` is a stationary spectral gate:
//!
//! 1. STFT (periodic Hann, 1024 / 256, centered with zero padding).
//! 2. Per-bin mean and standard deviation of the amplitude in dB across frames.
//! 3. Bins above `mean + n_std · std` pass, the rest are attenuated by
//!    `prop_decrease`.
//! 4. The mask is box-smoothed in time and frequency, applied, and the signal
//!    is rebuilt by windowed overlap-add.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

/// Which denoiser the engine builds from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseMode {
    None,
    SpectralGate,
}

/// External noise-reduction primitive.
pub trait Denoiser: Send + Sync {
    /// Return a filtered copy of `samples`. Output length must equal input length.
    fn denoise(&self, samples: &[f32], sample_rate: u32) -> Vec<f32>;
}

/// Leaves the signal untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Denoiser for Passthrough {
    fn denoise(&self, samples: &[f32], _sample_rate: u32) -> Vec<f32> {
        samples.to_vec()
    }
}

pub fn from_mode(mode: DenoiseMode) -> Arc<dyn Denoiser> {
    match mode {
        DenoiseMode::None => Arc::new(Passthrough),
        DenoiseMode::SpectralGate => Arc::new(SpectralGate::default()),
    }
}

pub struct SpectralGate {
    n_fft: usize,
    hop: usize,
    n_std: f32,
    prop_decrease: f32,
    time_smooth_ms: f32,
    freq_smooth_hz: f32,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl SpectralGate {
    pub fn new(n_fft: usize, hop: usize, n_std: f32, prop_decrease: f32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let window = (0..n_fft)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_fft as f32).cos())
            })
            .collect();
        Self {
            n_fft,
            hop: hop.max(1),
            n_std,
            prop_decrease: prop_decrease.clamp(0.0, 1.0),
            time_smooth_ms: 50.0,
            freq_smooth_hz: 500.0,
            window,
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    fn stft(&self, padded: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let n_frames = (padded.len() - self.n_fft) / self.hop + 1;
        let mut scratch = vec![Complex::new(0.0, 0.0); self.forward.get_inplace_scratch_len()];
        (0..n_frames)
            .map(|f| {
                let start = f * self.hop;
                let mut buf: Vec<Complex<f32>> = padded[start..start + self.n_fft]
                    .iter()
                    .zip(&self.window)
                    .map(|(s, w)| Complex::new(s * w, 0.0))
                    .collect();
                self.forward.process_with_scratch(&mut buf, &mut scratch);
                buf
            })
            .collect()
    }

    fn gate_mask(&self, spectra: &[Vec<Complex<f32>>], sample_rate: u32) -> Vec<Vec<f32>> {
        let n_bins = self.n_fft / 2 + 1;
        let n_frames = spectra.len();

        let db: Vec<Vec<f32>> = spectra
            .iter()
            .map(|frame| {
                frame[..n_bins]
                    .iter()
                    .map(|c| 20.0 * c.norm().max(1e-10).log10())
                    .collect()
            })
            .collect();

        let mut thresholds = vec![0f32; n_bins];
        for (k, threshold) in thresholds.iter_mut().enumerate() {
            let mean = db.iter().map(|f| f[k]).sum::<f32>() / n_frames as f32;
            let var = db.iter().map(|f| (f[k] - mean).powi(2)).sum::<f32>() / n_frames as f32;
            *threshold = mean + self.n_std * var.sqrt();
        }

        let keep = 1.0 - self.prop_decrease;
        let raw: Vec<Vec<f32>> = db
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .zip(&thresholds)
                    .map(|(v, t)| if v > t { 1.0 } else { keep })
                    .collect()
            })
            .collect();

        let frame_ms = self.hop as f32 / sample_rate as f32 * 1_000.0;
        let bin_hz = sample_rate as f32 / self.n_fft as f32;
        let time_radius = ((self.time_smooth_ms / frame_ms) / 2.0).round() as usize;
        let freq_radius = ((self.freq_smooth_hz / bin_hz) / 2.0).round() as usize;
        box_smooth(&raw, time_radius, freq_radius)
    }
}

impl Default for SpectralGate {
    fn default() -> Self {
        Self::new(1024, 256, 1.5, 1.0)
    }
}

impl Denoiser for SpectralGate {
    fn denoise(&self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        if samples.is_empty() || sample_rate == 0 {
            return samples.to_vec();
        }

        let pad = self.n_fft / 2;
        // Pad so the last frame still covers the final input sample.
        let tail = self.n_fft + self.hop - (samples.len() + 2 * pad - self.n_fft) % self.hop;
        let mut padded = vec![0f32; pad];
        padded.extend_from_slice(samples);
        padded.resize(padded.len() + pad + tail, 0.0);

        let mut spectra = self.stft(&padded);
        let mask = self.gate_mask(&spectra, sample_rate);

        let mut out = vec![0f32; padded.len()];
        let mut norm = vec![0f32; padded.len()];
        let mut scratch = vec![Complex::new(0.0, 0.0); self.inverse.get_inplace_scratch_len()];
        let scale = 1.0 / self.n_fft as f32;

        for (f, (frame, gains)) in spectra.iter_mut().zip(&mask).enumerate() {
            for (k, bin) in frame.iter_mut().enumerate() {
                let mirrored = if k <= self.n_fft / 2 { k } else { self.n_fft - k };
                *bin *= gains[mirrored];
            }
            self.inverse.process_with_scratch(frame, &mut scratch);
            let start = f * self.hop;
            for (i, (c, w)) in frame.iter().zip(&self.window).enumerate() {
                out[start + i] += c.re * scale * w;
                norm[start + i] += w * w;
            }
        }

        out[pad..pad + samples.len()]
            .iter()
            .zip(&norm[pad..pad + samples.len()])
            .map(|(&v, &n)| if n > 1e-8 { v / n } else { 0.0 })
            .collect()
    }
}

/// Separable moving average over a `[frames][bins]` grid, edges shrink the window.
fn box_smooth(grid: &[Vec<f32>], time_radius: usize, freq_radius: usize) -> Vec<Vec<f32>> {
    let n_frames = grid.len();
    let n_bins = grid.first().map_or(0, Vec::len);

    let along_freq: Vec<Vec<f32>> = grid
        .iter()
        .map(|row| {
            (0..n_bins)
                .map(|k| {
                    let lo = k.saturating_sub(freq_radius);
                    let hi = (k + freq_radius).min(n_bins - 1);
                    row[lo..=hi].iter().sum::<f32>() / (hi - lo + 1) as f32
                })
                .collect()
        })
        .collect();

    (0..n_frames)
        .map(|f| {
            let lo = f.saturating_sub(time_radius);
            let hi = (f + time_radius).min(n_frames - 1);
            let count = (hi - lo + 1) as f32;
            (0..n_bins)
                .map(|k| along_freq[lo..=hi].iter().map(|r| r[k]).sum::<f32>() / count)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn preserves_length() {
        let gate = SpectralGate::default();
        for len in [1usize, 100, 1024, 4_097, 16_000] {
            let samples = vec![0.1f32; len];
            assert_eq!(gate.denoise(&samples, 16_000).len(), len);
        }
    }

    #[test]
    fn silence_stays_silent() {
        let out = SpectralGate::default().denoise(&vec![0.0; 8_000], 16_000);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn keeps_burst_and_suppresses_steady_background() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 48_000;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let background = rng.gen_range(-0.001f32..0.001);
                if (21_000..26_000).contains(&i) {
                    background + rng.gen_range(-0.8f32..0.8)
                } else {
                    background
                }
            })
            .collect();

        let out = SpectralGate::default().denoise(&samples, 16_000);
        assert!(out.iter().all(|s| s.is_finite()));

        let burst_in = rms(&samples[22_000..25_000]);
        let burst_out = rms(&out[22_000..25_000]);
        assert!(burst_out > 0.8 * burst_in, "burst {burst_out} vs {burst_in}");

        let quiet_in = rms(&samples[0..12_000]);
        let quiet_out = rms(&out[0..12_000]);
        assert!(quiet_out < 0.5 * quiet_in, "quiet {quiet_out} vs {quiet_in}");
    }

    #[test]
    fn passthrough_is_identity() {
        let samples = vec![0.5, -0.25, 0.125];
        assert_eq!(Passthrough.denoise(&samples, 16_000), samples);
    }
}
