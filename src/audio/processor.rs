//! The stage interface every pipeline element implements.

use std::fmt;

use super::format::{AudioChunk, AudioFormat, Codec};
use crate::error::{AudioError, Result};

/// What a stage consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Compressed(Codec),
    Pcm(AudioFormat),
    /// PCM whose format is only known once the stream header has been read.
    Pending,
}

impl Port {
    /// Whether a stage producing `self` may feed a stage consuming `input`.
    pub fn feeds(&self, input: &Port) -> bool {
        match (self, input) {
            (Port::Compressed(a), Port::Compressed(b)) => a == b,
            (Port::Pcm(a), Port::Pcm(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Compressed(codec) => write!(f, "compressed:{}", codec),
            Port::Pcm(format) => write!(f, "pcm {}", format),
            Port::Pending => write!(f, "pcm (format not yet known)"),
        }
    }
}

/// One step of a pipeline.
///
/// A processor is owned by exactly one pipeline and driven from one thread
/// at a time; it never needs to be reentrant.
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    fn input(&self) -> Port;

    fn output(&self) -> Port;

    /// Consume one chunk. `None` means the stage is buffering.
    fn process(&mut self, chunk: AudioChunk) -> Result<Option<AudioChunk>>;

    /// End of stream: hand out whatever is still buffered.
    fn flush(&mut self) -> Result<Option<AudioChunk>> {
        Ok(None)
    }

    /// Release resources. Buffered data is discarded.
    fn close(&mut self) {}
}

/// Fail fast if `upstream` cannot feed `downstream`.
pub fn check_link(upstream: &dyn Processor, downstream: &dyn Processor) -> Result<()> {
    let produced = upstream.output();
    let expected = downstream.input();
    if produced.feeds(&expected) {
        Ok(())
    } else {
        Err(AudioError::IncompatibleStages {
            upstream: upstream.name(),
            downstream: downstream.name(),
            produced: produced.to_string(),
            expected: expected.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleType;

    #[test]
    fn pending_ports_never_link() {
        let f = AudioFormat::new(16_000, SampleType::Int16, 1).unwrap();
        assert!(Port::Pcm(f).feeds(&Port::Pcm(f)));
        assert!(!Port::Pending.feeds(&Port::Pcm(f)));
        assert!(!Port::Pcm(f).feeds(&Port::Pending));
        assert!(!Port::Compressed(Codec::OggOpus).feeds(&Port::Pcm(f)));
        assert!(Port::Compressed(Codec::OggOpus).feeds(&Port::Compressed(Codec::OggOpus)));
    }
}
