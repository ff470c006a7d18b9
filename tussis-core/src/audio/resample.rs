//! Whole-clip sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Only used when `resample_mismatched` is enabled; by default a clip tagged
//! with a different rate is analysed as-is and the mismatch is reported as a
//! warning.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::info;

use crate::error::{Result, TussisError};

/// Input frame count per rubato call.
const CHUNK: usize = 1024;

/// Converts mono f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `TussisError::Resample` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                ratio,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            CHUNK,
            1, // mono
        )
        .map_err(|e| TussisError::Resample(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(source_rate, target_rate, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Resample a complete clip.
    ///
    /// The tail is zero-padded to a full chunk and the output is truncated to
    /// `round(len · ratio)` samples, so the result has the duration of the input.
    pub fn process_clip(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.resampler else {
            return Ok(samples.to_vec());
        };

        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let mut result = Vec::with_capacity(expected + CHUNK);
        let mut padded = [0f32; CHUNK];

        for block in samples.chunks(CHUNK) {
            let input: &[f32] = if block.len() == CHUNK {
                block
            } else {
                padded[..block.len()].copy_from_slice(block);
                padded[block.len()..].fill(0.0);
                &padded
            };
            let (_consumed, produced) = resampler
                .process_into_buffer(&[input], &mut self.output_buf, None)
                .map_err(|e| TussisError::Resample(e.to_string()))?;
            result.extend_from_slice(&self.output_buf[0][..produced]);
        }

        // Flush the filter delay so the last input samples reach the output.
        while result.len() < expected {
            padded.fill(0.0);
            let (_consumed, produced) = resampler
                .process_into_buffer(&[&padded[..]], &mut self.output_buf, None)
                .map_err(|e| TussisError::Resample(e.to_string()))?;
            if produced == 0 {
                break;
            }
            result.extend_from_slice(&self.output_buf[0][..produced]);
        }

        result.truncate(expected);
        resampler.reset();
        Ok(result)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
