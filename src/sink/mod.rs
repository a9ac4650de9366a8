//! Terminal stages: the concrete places audio ends up.

pub mod speaker;
pub mod track;

use std::fmt;

use bytes::Bytes;

use crate::audio::format::{AudioChunk, AudioFormat};
use crate::audio::processor::{Port, Processor};
use crate::error::{AudioError, Result};

pub use speaker::{AlsaPlayback, PlaybackDevice, SpeakerSink};
pub use track::{track_channel, NetworkTrackSink, TrackFrame, TrackHandle, TrackReceiver};

/// Which adapter a destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Speaker,
    NetworkTrack,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Speaker => write!(f, "speaker"),
            DestinationKind::NetworkTrack => write!(f, "track"),
        }
    }
}

/// A concrete output.
///
/// `deliver` receives bytes already in `required_format()`. It may block for
/// at most the device buffer latency and reports failures as errors instead
/// of panicking into the caller.
pub trait Destination: Send {
    fn kind(&self) -> DestinationKind;

    fn required_format(&self) -> AudioFormat;

    fn deliver(&mut self, data: Bytes) -> Result<()>;

    /// End of stream.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Adapts a [`Destination`] to the stage interface. Always the last stage.
pub struct SinkStage {
    destination: Box<dyn Destination>,
}

impl SinkStage {
    pub fn new(destination: Box<dyn Destination>) -> Self {
        Self { destination }
    }

    pub fn kind(&self) -> DestinationKind {
        self.destination.kind()
    }
}

impl Processor for SinkStage {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn input(&self) -> Port {
        Port::Pcm(self.destination.required_format())
    }

    fn output(&self) -> Port {
        Port::Pcm(self.destination.required_format())
    }

    fn process(&mut self, chunk: AudioChunk) -> Result<Option<AudioChunk>> {
        let format = chunk.pcm_format()?;
        let required = self.destination.required_format();
        if format != required {
            return Err(AudioError::Format(format!(
                "{} sink requires {}, chunk is {}",
                self.destination.kind(),
                required,
                format
            )));
        }
        if !chunk.is_empty() {
            self.destination.deliver(chunk.into_data())?;
        }
        Ok(None)
    }

    fn flush(&mut self) -> Result<Option<AudioChunk>> {
        self.destination.flush()?;
        Ok(None)
    }

    fn close(&mut self) {
        self.destination.close();
    }
}
