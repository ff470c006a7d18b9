//! Energy-based leading/trailing silence removal.
//!
//! ## Algorithm
//!
//! 1. RMS over frames of `frame_length`, advancing by `hop_length`. A frame is
//!    only formed while `start < len − frame_length`.
//! 2. `db = 20·log10(rms + 1e-7)`.
//! 3. Keep frames with `db > max_db − top_db`.
//! 4. Return samples `[first · hop, (last + 1) · hop)`.
//!
//! Too-short input, an all-silent clip, or a clip with no frame above the
//! threshold comes back unmodified, never empty.

use std::ops::Range;

use super::rms;

const RMS_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy)]
pub struct SilenceTrimmer {
    /// Threshold below the loudest frame, in dB. Default: 40.
    top_db: f32,
    frame_length: usize,
    hop_length: usize,
}

impl SilenceTrimmer {
    pub fn new(top_db: f32, frame_length: usize, hop_length: usize) -> Self {
        Self {
            top_db,
            frame_length: frame_length.max(1),
            hop_length: hop_length.max(1),
        }
    }

    fn frame_rms(&self, samples: &[f32]) -> Vec<f32> {
        if samples.len() <= self.frame_length {
            return Vec::new();
        }
        let last_start = samples.len() - self.frame_length;
        (0..last_start)
            .step_by(self.hop_length)
            .map(|start| rms(&samples[start..start + self.frame_length]))
            .collect()
    }

    /// Sample range of the non-silent region, `None` when nothing qualifies.
    pub fn active_range(&self, samples: &[f32]) -> Option<Range<usize>> {
        let frame_rms = self.frame_rms(samples);
        // A clip with no energy at all has no loudest frame to measure against.
        if frame_rms.iter().all(|&r| r <= 0.0) {
            return None;
        }
        let levels: Vec<f32> = frame_rms
            .into_iter()
            .map(|r| 20.0 * (r + RMS_EPSILON).log10())
            .collect();
        let max_db = levels.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let threshold = max_db - self.top_db;

        let first = levels.iter().position(|&db| db > threshold)?;
        let last = levels.iter().rposition(|&db| db > threshold)?;

        let start = first * self.hop_length;
        let end = ((last + 1) * self.hop_length).min(samples.len());
        (start < end).then_some(start..end)
    }

    /// Trimmed view of `samples`; the input itself when nothing can be trimmed.
    pub fn trim<'a>(&self, samples: &'a [f32]) -> &'a [f32] {
        match self.active_range(samples) {
            Some(range) => &samples[range],
            None => samples,
        }
    }
}

impl Default for SilenceTrimmer {
    fn default() -> Self {
        Self::new(40.0, 2048, 512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_burst(lead: usize, burst: usize, tail: usize) -> Vec<f32> {
        let mut samples = vec![0.0f32; lead];
        samples.extend((0..burst).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }));
        samples.extend(std::iter::repeat(0.0).take(tail));
        samples
    }

    #[test]
    fn removes_leading_and_trailing_silence() {
        let trimmer = SilenceTrimmer::default();
        let samples = padded_burst(8_192, 8_192, 8_192);
        let range = trimmer.active_range(&samples).expect("burst is audible");
        assert!(range.start > 4_096, "start={}", range.start);
        assert!(range.end < 20_480, "end={}", range.end);
        assert!(range.start <= 8_192 && range.end >= 16_384 - 512);
        assert_eq!(range.start % 512, 0);
        assert!(trimmer.trim(&samples).len() < samples.len());
    }

    #[test]
    fn all_silent_clip_is_returned_unmodified() {
        let trimmer = SilenceTrimmer::default();
        let samples = vec![0.0f32; 10_000];
        assert!(trimmer.active_range(&samples).is_none());
        assert_eq!(trimmer.trim(&samples).len(), samples.len());
    }

    #[test]
    fn shorter_than_one_frame_is_returned_unmodified() {
        let trimmer = SilenceTrimmer::default();
        let samples = vec![0.3f32; 2_000];
        assert_eq!(trimmer.trim(&samples), &samples[..]);
        let exact = vec![0.3f32; 2_048];
        assert_eq!(trimmer.trim(&exact), &exact[..]);
    }

    #[test]
    fn never_longer_than_input() {
        let trimmer = SilenceTrimmer::new(20.0, 256, 64);
        for len in [300usize, 511, 1_000, 4_321] {
            let samples: Vec<f32> = (0..len).map(|i| ((i * 7919) % 97) as f32 / 97.0).collect();
            let out = trimmer.trim(&samples);
            assert!(!out.is_empty());
            assert!(out.len() <= samples.len());
        }
    }

    #[test]
    fn steady_signal_keeps_frame_aligned_span() {
        let trimmer = SilenceTrimmer::default();
        let samples = vec![0.5f32; 10_000];
        let range = trimmer.active_range(&samples).expect("steady tone");
        // 16 frames (starts 0..7952 step 512), end = 16 · 512.
        assert_eq!(range, 0..8_192);
    }
}
