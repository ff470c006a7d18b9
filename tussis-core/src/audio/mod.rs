//! Waveform loading and normalization.
//!
//! A `Waveform` is created once per request, mixed down to mono and
//! peak-normalized, then handed to the later stages by reference. Nothing here
//! is shared between requests.

pub mod denoise;
pub mod resample;
pub mod wav;

use crate::error::{Result, TussisError};

/// A block of PCM samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Interleaved samples. After `into_mono` there is exactly one channel.
    samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    sample_rate: u32,
    channels: u16,
}

impl Waveform {
    /// Wrap interleaved samples. The sample count must divide evenly by `channels`.
    pub fn from_interleaved(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(TussisError::InvalidAudio("channel count is zero".into()));
        }
        if sample_rate == 0 {
            return Err(TussisError::InvalidAudio("sample rate is zero".into()));
        }
        if samples.is_empty() {
            return Err(TussisError::InvalidAudio("no samples".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(TussisError::InvalidAudio(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(TussisError::InvalidAudio("non-finite sample".into()));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::from_interleaved(samples, 1, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Returns the duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one.
    pub fn into_mono(self) -> Self {
        if self.channels == 1 {
            return self;
        }
        let ch = self.channels as usize;
        let samples = self
            .samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect();
        Self {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
        }
    }

    /// Scale so the loudest sample has magnitude 1.0. Silence stays silent.
    pub fn normalized(mut self) -> Self {
        normalize_peak_in_place(&mut self.samples);
        self
    }

    /// Replace the samples, keeping rate and channel layout.
    pub(crate) fn with_samples(&self, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: self.channels,
        }
    }
}

/// Largest absolute sample value, 0.0 for an empty slice.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

fn normalize_peak_in_place(samples: &mut [f32]) {
    let max = peak(samples);
    if max <= 0.0 {
        return;
    }
    let gain = 1.0 / max;
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}
