//! File-format registry: the narrow seam between the engine and codecs.
//!
//! The transport controller only ever asks the registry to open a reader
//! for a path; everything codec-specific stays behind [`SampleReader`].

use std::fs::File;
use std::path::Path;

use cadenza_core::{Error, Result, StreamInfo};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// A decoded-audio producer bound to one stream.
///
/// Implementations run on the decode worker thread; they may allocate and
/// perform blocking I/O. The render path never calls into a reader.
pub trait SampleReader: Send {
    /// Stream description (rate, channels, known length).
    fn info(&self) -> StreamInfo;

    /// Decode the next packet as interleaved f32 frames.
    ///
    /// Returns `Ok(None)` at end of stream. Corrupt packets are skipped
    /// internally, not surfaced.
    fn read_packet(&mut self) -> Result<Option<Vec<f32>>>;

    /// Reposition the stream to `seconds` from the origin.
    fn seek(&mut self, seconds: f64) -> Result<()>;
}

/// Opens readers for filesystem paths.
///
/// Given a path, returns either a stream reader or a failure indicating the
/// format is unrecognized/unreadable. The engine depends only on this
/// factory, not on any specific codec.
pub trait FormatRegistry: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn SampleReader>>;
}

/// Default registry backed by symphonia's probe and codec set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaRegistry;

impl FormatRegistry for SymphoniaRegistry {
    fn open(&self, path: &Path) -> Result<Box<dyn SampleReader>> {
        Ok(Box::new(SymphoniaReader::open(path)?))
    }
}

/// Symphonia-backed [`SampleReader`] for a single file.
pub struct SymphoniaReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: StreamInfo,
}

impl SymphoniaReader {
    /// Probe and open `path`, selecting the first audio track.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("{}: {e}", path.display())))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::UnsupportedFormat("no audio track found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        #[allow(clippy::cast_possible_truncation)]
        let channels = track.codec_params.channels.map_or(2, |c| c.count() as u16);
        let n_frames = track.codec_params.n_frames;

        debug!(
            "Opened track: id={}, sample_rate={}, channels={}, frames={:?}",
            track_id, sample_rate, channels, n_frames
        );

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("failed to create decoder: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            info: StreamInfo {
                sample_rate,
                channels,
                n_frames,
            },
        })
    }
}

impl SampleReader for SymphoniaReader {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read_packet(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None); // End of stream
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode(format!("failed to read packet: {e}")));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => return Ok(Some(audio_buffer_to_f32(&decoded))),
                Err(SymphoniaError::DecodeError(e)) => {
                    // Skip corrupt frames and keep going.
                    warn!("Decode error (skipping): {e}");
                }
                Err(e) => return Err(Error::Decode(format!("decode failed: {e}"))),
            }
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(seconds.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Seek(e.to_string()))?;

        // Decoder state is stale after a format-level seek.
        self.decoder.reset();
        Ok(())
    }
}

/// Convert an `AudioBuffer` of any sample format to interleaved f32.
#[allow(clippy::cast_possible_truncation)]
fn audio_buffer_to_f32(buffer: &AudioBufferRef<'_>) -> Vec<f32> {
    match buffer {
        AudioBufferRef::F32(buf) => interleave(buf.planes().planes(), |s| s),
        AudioBufferRef::F64(buf) => interleave(buf.planes().planes(), |s| s as f32),
        AudioBufferRef::S32(buf) => interleave(buf.planes().planes(), |s| {
            #[allow(clippy::cast_precision_loss)]
            let v = s as f32 / i32::MAX as f32;
            v
        }),
        AudioBufferRef::S16(buf) => {
            interleave(buf.planes().planes(), |s| f32::from(s) / f32::from(i16::MAX))
        }
        AudioBufferRef::U8(buf) => {
            interleave(buf.planes().planes(), |s| (f32::from(s) - 128.0) / 128.0)
        }
        _ => Vec::new(),
    }
}

fn interleave<T: Copy>(planes: &[&[T]], convert: impl Fn(T) -> f32) -> Vec<f32> {
    if planes.is_empty() {
        return Vec::new();
    }

    let frames = planes[0].len();
    let mut output = Vec::with_capacity(frames * planes.len());

    for frame in 0..frames {
        for plane in planes {
            output.push(convert(plane[frame]));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file() {
        let registry = SymphoniaRegistry;
        let result = registry.open(Path::new("/definitely/not/here.wav"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_interleave_order() {
        let left = [1.0f32, 3.0];
        let right = [2.0f32, 4.0];
        let planes: [&[f32]; 2] = [&left, &right];
        let out = interleave(&planes, |s| s);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
