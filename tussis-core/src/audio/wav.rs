//! WAV decoding via `hound`.
//!
//! Integer PCM is scaled to [-1.0, 1.0) by its bit depth; float PCM passes
//! through. Channels stay interleaved; mixing happens in `Waveform::into_mono`.

use std::io::Read;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use tracing::debug;

use super::Waveform;
use crate::error::{Result, TussisError};

impl Waveform {
    /// Decode a WAV file from disk.
    pub fn load_wav(path: &Path) -> Result<Self> {
        let reader = WavReader::open(path)
            .map_err(|e| TussisError::AudioDecode(format!("{}: {e}", path.display())))?;
        let wave = decode(reader)?;
        debug!(
            path = %path.display(),
            sample_rate = wave.sample_rate(),
            channels = wave.channels(),
            frames = wave.frames(),
            "decoded wav"
        );
        Ok(wave)
    }

    /// Decode WAV bytes from any reader (uploaded buffers, tests).
    pub fn read_wav<R: Read>(reader: R) -> Result<Self> {
        let reader =
            WavReader::new(reader).map_err(|e| TussisError::AudioDecode(e.to_string()))?;
        decode(reader)
    }
}

fn decode<R: Read>(mut reader: WavReader<R>) -> Result<Waveform> {
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TussisError::AudioDecode(e.to_string()))?,
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(TussisError::AudioDecode(format!(
                    "unsupported bit depth {}",
                    spec.bits_per_sample
                )));
            }
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| TussisError::AudioDecode(e.to_string()))?
        }
    };
    Waveform::from_interleaved(samples, spec.channels, spec.sample_rate)
}
