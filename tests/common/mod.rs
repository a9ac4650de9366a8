#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use voice_pipeline::audio::format::{bytes_to_samples_i16, AudioFormat};
use voice_pipeline::audio::ogg::{Page, FLAG_BOS, FLAG_EOS};
use voice_pipeline::audio::opus_codec::{opus_tags, OpusHead, OPUS_SAMPLE_RATE};
use voice_pipeline::sink::{Destination, DestinationKind};
use voice_pipeline::{AudioError, Result};

/// Encoder delay written into generated headers.
pub const PRE_SKIP: u16 = 312;

pub fn tone_i16(freq: f32, rate: u32, frames: usize, amplitude: f32) -> Vec<i16> {
    (0..frames)
        .map(|i| {
            let t = i as f32 / rate as f32;
            (amplitude * 32767.0 * (2.0 * std::f32::consts::PI * freq * t).sin()) as i16
        })
        .collect()
}

pub fn zero_crossings(samples: &[i16]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] < 0) != (w[1] < 0))
        .count()
}

pub fn rms(samples: &[i16]) -> f64 {
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len().max(1) as f64).sqrt()
}

#[derive(Default)]
pub struct Recorded {
    pub chunks: Vec<Bytes>,
    pub flushes: usize,
    pub closes: usize,
}

impl Recorded {
    pub fn samples(&self) -> Vec<i16> {
        self.chunks
            .iter()
            .flat_map(|c| bytes_to_samples_i16(c))
            .collect()
    }

    pub fn bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Destination that keeps everything it is given.
pub struct Recorder {
    format: AudioFormat,
    log: Arc<Mutex<Recorded>>,
    /// Refuse deliveries once this many chunks have arrived.
    fail_after: Option<usize>,
}

impl Recorder {
    pub fn new(format: AudioFormat) -> (Self, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        (
            Self {
                format,
                log: log.clone(),
                fail_after: None,
            },
            log,
        )
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn shared(format: AudioFormat, log: Arc<Mutex<Recorded>>) -> Self {
        Self {
            format,
            log,
            fail_after: None,
        }
    }
}

impl Destination for Recorder {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Speaker
    }

    fn required_format(&self) -> AudioFormat {
        self.format
    }

    fn deliver(&mut self, data: Bytes) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if self.fail_after.is_some_and(|n| log.chunks.len() >= n) {
            return Err(AudioError::SinkClosed("recorder unplugged".into()));
        }
        log.chunks.push(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}

/// Encode mono 48 kHz samples as a complete OGG/Opus stream.
///
/// The final granule position declares exactly `samples.len()` samples after
/// pre-skip; the encoder input is padded so the delayed tail is encoded.
pub fn ogg_opus_stream(samples: &[i16]) -> Vec<u8> {
    const FRAME: usize = 960;
    let mut encoder = opus::Encoder::new(
        OPUS_SAMPLE_RATE,
        opus::Channels::Mono,
        opus::Application::Audio,
    )
    .unwrap();

    let head = OpusHead::new(1, PRE_SKIP, OPUS_SAMPLE_RATE).to_bytes();
    let tags = opus_tags("voice_pipeline tests");
    let mut out = Page::with_packets(FLAG_BOS, 0, 0x5EED, 0, &[&head[..]]).to_bytes();
    out.extend(Page::with_packets(0, 0, 0x5EED, 1, &[&tags[..]]).to_bytes());

    let end = PRE_SKIP as usize + samples.len();
    let mut padded = samples.to_vec();
    padded.resize(end.div_ceil(FRAME) * FRAME, 0);

    let frames = padded.len() / FRAME;
    for (i, frame) in padded.chunks(FRAME).enumerate() {
        let packet = encoder.encode_vec(frame, 4000).unwrap();
        let last = i + 1 == frames;
        let granule = if last { end } else { (i + 1) * FRAME };
        let flags = if last { FLAG_EOS } else { 0 };
        out.extend(
            Page::with_packets(flags, granule as i64, 0x5EED, 2 + i as u32, &[&packet[..]])
                .to_bytes(),
        );
    }
    out
}
