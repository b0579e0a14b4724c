//! Shared domain types for Cadenza.

/// Description of an opened audio stream, reported by the format registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Native sample rate of the stream in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Total length in frames, when the container reports one.
    pub n_frames: Option<u64>,
}

impl StreamInfo {
    /// Duration in seconds, when the length is known.
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> Option<f64> {
        self.n_frames
            .map(|frames| frames as f64 / f64::from(self.sample_rate))
    }
}

/// Parameters of one real-time render session, supplied by the host at
/// prepare time and fixed until release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Engine sample rate in Hz.
    pub sample_rate: u32,
    /// Expected frames per render callback.
    pub block_size: u32,
}
