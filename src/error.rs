//! Error types shared by every pipeline stage.

use thiserror::Error;

use crate::audio::format::AudioFormat;

#[derive(Debug, Error)]
pub enum AudioError {
    /// Chunk geometry does not describe whole frames, or a chunk carries the
    /// wrong format. Only the offending chunk is lost.
    #[error("malformed chunk: {0}")]
    Format(String),

    /// Compressed input is corrupt or cannot be synchronised.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The stream declares parameters the decoder cannot handle.
    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// The destination went away.
    #[error("destination closed: {0}")]
    SinkClosed(String),

    #[error("pipeline is closed")]
    PipelineClosed,

    /// Adjacent stages disagree on the format passed between them.
    #[error("stage {upstream} produces {produced} but {downstream} expects {expected}")]
    IncompatibleStages {
        upstream: &'static str,
        downstream: &'static str,
        produced: String,
        expected: String,
    },

    /// The playback device could not be opened or configured.
    #[error("audio device error: {0}")]
    Device(String),
}

impl AudioError {
    /// Recoverable errors drop one chunk and let the stream continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AudioError::Format(_))
    }

    pub(crate) fn misaligned(len: usize, format: &AudioFormat) -> Self {
        AudioError::Format(format!(
            "{} bytes is not a whole number of {}-byte frames ({})",
            len,
            format.bytes_per_frame(),
            format
        ))
    }
}

pub type Result<T> = std::result::Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_format_errors_are_recoverable() {
        assert!(AudioError::Format("x".into()).is_recoverable());
        assert!(!AudioError::Decode("x".into()).is_recoverable());
        assert!(!AudioError::UnsupportedFormat("x".into()).is_recoverable());
        assert!(!AudioError::SinkClosed("x".into()).is_recoverable());
        assert!(!AudioError::PipelineClosed.is_recoverable());
    }
}
