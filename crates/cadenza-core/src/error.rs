//! Error types for Cadenza.

use thiserror::Error;

/// Result type alias using Cadenza's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cadenza.
///
/// Only the control path returns these; render-path faults are absorbed
/// into silence and never surface as errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unrecognized or unreadable format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("Audio output error: {0}")]
    Output(String),

    #[error("Playback worker unavailable: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the caller may retry the operation with different
    /// input (e.g. another file path).
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_) | Self::Decode(_) | Self::Seek(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverable() {
        assert!(Error::UnsupportedFormat("test".into()).is_recoverable());
        assert!(!Error::Worker("gone".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedFormat("no codec".into());
        assert_eq!(err.to_string(), "Unrecognized or unreadable format: no codec");
    }
}
