//! # cadenza-audio
//!
//! Streaming audio playback engine for Cadenza.
//!
//! Two halves with strictly asymmetric obligations:
//! - the control path ([`TransportController`]) loads files and sequences
//!   play/pause/stop through an explicit state machine;
//! - the render path ([`TransportController::render_next_block`]) pulls
//!   decoded blocks out of a lock-free ring buffer and must never block,
//!   allocate, or fail.
//!
//! A background decode worker bridges the two.

pub mod buffer;
pub mod formats;
pub mod output;
pub mod resample;
pub mod source;
pub mod transport;

pub use formats::{FormatRegistry, SampleReader, SymphoniaRegistry};
pub use output::AudioOutput;
pub use source::PlaybackSource;
pub use transport::{TransportController, TransportState};
