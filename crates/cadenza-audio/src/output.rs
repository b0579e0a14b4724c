//! Audio output: the host render callback, built on cpal.
//!
//! Owns the session lifecycle: the controller's source is prepared before
//! the stream delivers its first callback and released when the output is
//! dropped, exactly paired.

use std::sync::Arc;

use cadenza_core::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{debug, error, info};

use crate::transport::TransportController;

/// Frames requested from the engine per render cycle.
const BLOCK_FRAMES: usize = 1024;

/// Scratch capacity in samples; callbacks larger than this are served in
/// chunks rather than growing the buffer on the render path.
const SCRATCH_SAMPLES: usize = 8192;

/// Output stream wrapper driving [`TransportController::render_next_block`]
/// once per audio cycle.
pub struct AudioOutput {
    _stream: Stream,
    controller: Arc<TransportController>,
    device_name: String,
    sample_rate: u32,
}

impl AudioOutput {
    /// Open the default output device and start rendering.
    pub fn new(controller: Arc<TransportController>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Output("no output device found".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio output device: {device_name}");

        Self::with_device(device, controller)
    }

    /// Start rendering on a specific device.
    #[allow(clippy::needless_pass_by_value)] // Device is typically moved
    pub fn with_device(device: Device, controller: Arc<TransportController>) -> Result<Self> {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::Output(format!("failed to get output config: {e}")))?;

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let sample_rate = config.sample_rate.0;

        debug!(
            "Output config: {}Hz, {} channels, {:?}",
            sample_rate, config.channels, sample_format
        );

        // Session start: prime the pipeline before the first callback.
        #[allow(clippy::cast_possible_truncation)]
        controller.prepare(sample_rate, BLOCK_FRAMES as u32);

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, controller.clone()),
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, controller.clone()),
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, controller.clone()),
            other => Err(Error::Output(format!("unsupported sample format: {other:?}"))),
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                controller.release();
                return Err(e);
            }
        };

        if let Err(e) = stream.play() {
            controller.release();
            return Err(Error::Output(format!("failed to start stream: {e}")));
        }

        Ok(Self {
            _stream: stream,
            controller,
            device_name,
            sample_rate,
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &Device,
        config: &StreamConfig,
        controller: Arc<TransportController>,
    ) -> Result<Stream> {
        let err_fn = |err| {
            error!("Audio stream error: {err}");
        };

        // Preallocated: the callback must not allocate.
        let mut scratch = vec![0.0f32; SCRATCH_SAMPLES];

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(scratch.len()) {
                        let block = &mut scratch[..chunk.len()];
                        let _ = controller.render_next_block(block);
                        for (out, &sample) in chunk.iter_mut().zip(block.iter()) {
                            *out = T::from_sample(sample);
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::Output(format!("failed to build stream: {e}")))?;

        Ok(stream)
    }

    /// Name of the device rendering this session.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Session sample rate in Hz.
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        // Session end: pair the prepare from construction.
        self.controller.release();
    }
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Output(format!("failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // May yield an empty list on CI hosts without audio hardware;
        // just ensure it does not panic.
        let _ = list_output_devices();
    }
}
