//! Local speaker output through ALSA.
//!
//! Writes run on the output worker's own thread: `writei` blocks until the
//! device buffer has room, which is bounded by the period configuration.

use alsa::pcm::PCM;
use bytes::Bytes;

use super::{Destination, DestinationKind};
use crate::audio::alsa_device;
use crate::audio::format::AudioFormat;
use crate::error::{AudioError, Result};

/// Consecutive failed writes before the rest of a chunk is dropped.
const MAX_WRITE_RETRIES: u32 = 3;

/// A blocking PCM output.
pub trait PlaybackDevice: Send {
    /// Format the device was actually configured with.
    fn format(&self) -> AudioFormat;

    /// Write interleaved little-endian samples in `format()`.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Block until everything written has been played.
    fn drain(&mut self) -> Result<()>;
}

pub struct AlsaPlayback {
    pcm: PCM,
    format: AudioFormat,
}

impl AlsaPlayback {
    pub fn open(device: &str, requested: AudioFormat, period_size: Option<usize>) -> Result<Self> {
        let (pcm, params) = alsa_device::open_playback(device, requested, period_size)
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;
        if params.format != requested {
            log::warn!(
                "ALSA device '{}' negotiated {} instead of {}",
                device,
                params.format,
                requested
            );
        }
        Ok(Self {
            pcm,
            format: params.format,
        })
    }
}

impl PlaybackDevice for AlsaPlayback {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let frame_bytes = self.format.bytes_per_frame();
        let total_frames = data.len() / frame_bytes;
        let io = self.pcm.io_bytes();

        // Retry short writes and recover from XRUN without losing frames.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * frame_bytes;
            match io.writei(&data[offset..total_frames * frame_bytes]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = self.pcm.prepare() {
                        return Err(AudioError::SinkClosed(format!(
                            "failed to recover PCM playback: {}",
                            e2
                        )));
                    }

                    // The device cannot keep up: drop the rest of this chunk
                    // instead of spinning.
                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.pcm
            .drain()
            .map_err(|e| AudioError::SinkClosed(format!("ALSA drain failed: {}", e)))
    }
}

/// Speaker destination. Its required format is whatever the device accepted.
pub struct SpeakerSink {
    device: Option<Box<dyn PlaybackDevice>>,
    format: AudioFormat,
}

impl SpeakerSink {
    pub fn new(device: Box<dyn PlaybackDevice>) -> Self {
        let format = device.format();
        Self {
            device: Some(device),
            format,
        }
    }

    pub fn open(device: &str, requested: AudioFormat, period_size: Option<usize>) -> Result<Self> {
        let playback = AlsaPlayback::open(device, requested, period_size)?;
        Ok(Self::new(Box::new(playback)))
    }

    fn device(&mut self) -> Result<&mut Box<dyn PlaybackDevice>> {
        self.device
            .as_mut()
            .ok_or_else(|| AudioError::SinkClosed("speaker already closed".into()))
    }
}

impl Destination for SpeakerSink {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Speaker
    }

    fn required_format(&self) -> AudioFormat {
        self.format
    }

    fn deliver(&mut self, data: Bytes) -> Result<()> {
        self.device()?.write(&data)
    }

    fn flush(&mut self) -> Result<()> {
        self.device()?.drain()?;
        log::info!("Speaker drained");
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            log::debug!("Speaker closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleType;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        written: usize,
        drains: usize,
    }

    struct FakeDevice {
        format: AudioFormat,
        log: Arc<Mutex<Log>>,
    }

    impl PlaybackDevice for FakeDevice {
        fn format(&self) -> AudioFormat {
            self.format
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.log.lock().unwrap().written += data.len();
            Ok(())
        }

        fn drain(&mut self) -> Result<()> {
            self.log.lock().unwrap().drains += 1;
            Ok(())
        }
    }

    #[test]
    fn speaker_writes_drains_and_refuses_after_close() {
        let format = AudioFormat::new(44_100, SampleType::Int16, 2).unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let mut sink = SpeakerSink::new(Box::new(FakeDevice {
            format,
            log: log.clone(),
        }));
        assert_eq!(sink.required_format(), format);

        sink.deliver(Bytes::from(vec![0u8; 16])).unwrap();
        sink.flush().unwrap();
        sink.close();

        assert!(matches!(
            sink.deliver(Bytes::from_static(&[0, 0, 0, 0])),
            Err(AudioError::SinkClosed(_))
        ));
        let log = log.lock().unwrap();
        assert_eq!(log.written, 16);
        assert_eq!(log.drains, 1);
    }
}
