//! Signal processing stages: silence trimming, mel spectrogram, reshaping.

pub mod reshape;
pub mod spectral;
pub mod trim;

/// Compute the root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
