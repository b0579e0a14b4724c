//! # cadenza-core
//!
//! Core types and error handling for the Cadenza playback engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{SessionParams, StreamInfo};
