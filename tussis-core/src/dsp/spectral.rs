//! Mel spectrogram front end.
//!
//! ## Parameters (must match training)
//!
//! | Parameter       | Default        |
//! |-----------------|----------------|
//! | Hann window     | 2048 samples, symmetric |
//! | FFT size        | 2048           |
//! | Frequency bins  | 1025 (2048/2+1)|
//! | Hop length      | 512            |
//! | Mel bands       | 128, HTK formula, 0 Hz – sr/2 |
//! | dB floor        | peak − 80 dB   |
//!
//! Frames are not centered: a clip of `n` samples yields `1 + (n − n_fft) / hop`
//! frames and anything shorter than `n_fft` yields none.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Floor applied before taking the logarithm of a power value.
const POWER_FLOOR: f32 = 1e-10;

/// STFT → power → mel projection → dB compression.
///
/// Window, filterbank and FFT plan are built once; `analyze` only borrows
/// `self`, so one analyzer serves any number of concurrent requests.
pub struct SpectralAnalyzer {
    n_fft: usize,
    hop_length: usize,
    top_db: f32,
    window: Vec<f32>,
    /// `[n_mels, n_fft/2 + 1]`
    filterbank: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32, n_fft: usize, hop_length: usize, n_mels: usize, top_db: f32) -> Self {
        Self {
            n_fft,
            hop_length: hop_length.max(1),
            top_db,
            window: build_hann_window(n_fft),
            filterbank: build_mel_filterbank(sample_rate, n_fft, n_mels),
            fft: FftPlanner::<f32>::new().plan_fft_forward(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn n_mels(&self) -> usize {
        self.filterbank.nrows()
    }

    /// Number of STFT frames produced for `len` samples.
    pub fn frame_count(&self, len: usize) -> usize {
        if len < self.n_fft {
            0
        } else {
            1 + (len - self.n_fft) / self.hop_length
        }
    }

    /// Power spectrogram `[n_fft/2 + 1, frames]`, `None` below one frame.
    pub fn power_spectrogram(&self, samples: &[f32]) -> Option<Array2<f32>> {
        let n_frames = self.frame_count(samples.len());
        if n_frames == 0 {
            return None;
        }
        let n_bins = self.n_fft / 2 + 1;
        let mut power = Array2::<f32>::zeros((n_bins, n_frames));
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        for frame in 0..n_frames {
            let start = frame * self.hop_length;
            for (i, slot) in fft_buf.iter_mut().enumerate() {
                *slot = Complex::new(samples[start + i] * self.window[i], 0.0);
            }
            self.fft.process_with_scratch(&mut fft_buf, &mut scratch);
            for k in 0..n_bins {
                power[[k, frame]] = fft_buf[k].norm_sqr();
            }
        }
        Some(power)
    }

    /// Mel power spectrogram `[n_mels, frames]`.
    pub fn mel_power(&self, samples: &[f32]) -> Option<Array2<f32>> {
        self.power_spectrogram(samples)
            .map(|power| self.filterbank.dot(&power))
    }

    /// dB-compressed mel spectrogram `[n_mels, frames]`, `None` when the
    /// signal is shorter than one analysis frame.
    pub fn analyze(&self, samples: &[f32]) -> Option<Array2<f32>> {
        let mut mel = self.mel_power(samples)?;
        power_to_db_in_place(&mut mel, self.top_db);
        Some(mel)
    }
}

/// `10·log10(max(v, 1e-10))`, then clip everything below `peak − top_db`.
pub fn power_to_db_in_place(spec: &mut Array2<f32>, top_db: f32) {
    spec.mapv_inplace(|v| {
        let v = if v.is_finite() { v } else { 0.0 };
        10.0 * v.max(POWER_FLOOR).log10()
    });
    let max_val = spec.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_val.is_finite() {
        let floor = max_val - top_db;
        spec.mapv_inplace(|v| v.max(floor));
    }
}

pub fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f64::consts::PI;
    if n < 2 {
        return vec![1.0; n];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos()) as f32)
        .collect()
}

/// Triangular filters on FFT bin indices.
///
/// `n_mels + 2` points evenly spaced in mel between 0 and `sr/2`, mapped to
/// bins with `floor((n_fft + 1) · hz / sr)`. Filter `m` rises over
/// `[bin[m], bin[m+1])` and falls over `[bin[m+1], bin[m+2])`; collapsed
/// edges contribute nothing.
pub fn build_mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let mel_max = hz_to_mel(sr / 2.0);

    let bins: Vec<usize> = (0..n_mels + 2)
        .map(|i| {
            let mel = mel_max * i as f64 / (n_mels + 1) as f64;
            let bin = ((n_fft + 1) as f64 * mel_to_hz(mel) / sr).floor();
            (bin.max(0.0) as usize).min(n_bins - 1)
        })
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
        for j in left..center {
            filters[[m, j]] = (j - left) as f32 / (center - left) as f32;
        }
        for j in center..right {
            filters[[m, j]] = (right - j) as f32 / (right - center) as f32;
        }
    }
    filters
}
