//! Sample-rate correction between a source stream and the render session.

use cadenza_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

/// Frames consumed per resampler pass.
const CHUNK_FRAMES: usize = 1024;

/// Converts interleaved source-rate samples to session-rate samples.
///
/// Runs on the decode worker, so allocation is fine here. Input packets may
/// be any size; frames are accumulated until a full chunk is available.
pub struct Resampler {
    /// None when source and session rates match (passthrough).
    inner: Option<FftFixedIn<f32>>,
    channels: usize,
    /// Interleaved frames waiting for a full chunk.
    pending: Vec<f32>,
    /// Deinterleaved scratch, one plane per channel.
    planes: Vec<Vec<f32>>,
}

impl Resampler {
    /// Create a resampler from `input_rate` to `output_rate`.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let inner = if input_rate == output_rate {
            None
        } else {
            debug!(
                "Resampler created: {}Hz -> {}Hz, {} channels",
                input_rate, output_rate, channels
            );
            Some(
                FftFixedIn::new(
                    input_rate as usize,
                    output_rate as usize,
                    CHUNK_FRAMES,
                    2,
                    channels,
                )
                .map_err(|e| Error::Decode(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            pending: Vec::new(),
            planes: vec![Vec::with_capacity(CHUNK_FRAMES); channels],
        })
    }

    /// True when rate conversion actually happens.
    pub const fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Feed interleaved samples; returns converted interleaved samples.
    ///
    /// May return an empty vec while accumulating a full chunk.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(interleaved.to_vec());
        };

        self.pending.extend_from_slice(interleaved);

        let chunk_samples = CHUNK_FRAMES * self.channels;
        let mut output = Vec::new();

        while self.pending.len() >= chunk_samples {
            for plane in &mut self.planes {
                plane.clear();
            }
            for frame in self.pending[..chunk_samples].chunks_exact(self.channels) {
                for (plane, &sample) in self.planes.iter_mut().zip(frame) {
                    plane.push(sample);
                }
            }
            self.pending.drain(..chunk_samples);

            let resampled = inner
                .process(&self.planes, None)
                .map_err(|e| Error::Decode(format!("resampling failed: {e}")))?;

            let out_frames = resampled.first().map_or(0, Vec::len);
            output.reserve(out_frames * self.channels);
            for frame in 0..out_frames {
                for plane in &resampled {
                    output.push(plane[frame]);
                }
            }
        }

        Ok(output)
    }

    /// Drain frames still short of a full chunk, padding with silence.
    ///
    /// Call once at end of stream; the pending buffer is consumed, so a
    /// second flush returns nothing.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.inner.is_none() || self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_samples = CHUNK_FRAMES * self.channels;
        self.pending.resize(chunk_samples, 0.0);
        self.process(&[])
    }

    /// Discard accumulated frames, e.g. after a seek.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_passthrough() {
        let mut resampler = Resampler::new(48_000, 48_000, 2).unwrap();
        assert!(!resampler.is_active());

        let input = vec![0.25f32; 64];
        let output = resampler.process(&input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_accumulates_until_chunk() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();
        assert!(resampler.is_active());

        // Less than one chunk: nothing comes out yet.
        let small = vec![0.0f32; 2 * 100];
        assert!(resampler.process(&small).unwrap().is_empty());

        // Topping up past one chunk produces output near the rate ratio.
        let rest = vec![0.0f32; 2 * CHUNK_FRAMES];
        let output = resampler.process(&rest).unwrap();
        assert!(!output.is_empty());
        assert_eq!(output.len() % 2, 0);
    }

    #[test]
    fn test_flush_drains_partial_chunk() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();

        // A short stream: well under one chunk, so nothing comes out yet.
        let input = vec![0.5f32; 2 * 300];
        assert!(resampler.process(&input).unwrap().is_empty());

        let tail = resampler.flush().unwrap();
        assert!(!tail.is_empty());
        assert_eq!(tail.len() % 2, 0);

        // The pending buffer was consumed.
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_flush_is_empty_for_passthrough() {
        let mut resampler = Resampler::new(48_000, 48_000, 2).unwrap();
        let _ = resampler.process(&[0.5f32; 64]).unwrap();
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();
        assert!(resampler.process(&[0.5f32; 2 * 300]).unwrap().is_empty());

        resampler.reset();
        assert!(resampler.flush().unwrap().is_empty());
    }
}
