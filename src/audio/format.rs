//! PCM format descriptors and the chunk type passed between stages.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};

/// Sample encoding inside a raw PCM chunk. Always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    Int16,
    Float32,
}

impl SampleType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::Int16 => 2,
            SampleType::Float32 => 4,
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleType::Int16 => write!(f, "s16le"),
            SampleType::Float32 => write!(f, "f32le"),
        }
    }
}

/// Interpretation of raw PCM bytes. Two formats are compatible iff equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    sample_rate: u32,
    sample_type: SampleType,
    channels: u16,
}

impl AudioFormat {
    /// Format required by the network track: 48 kHz, 16-bit, mono.
    pub const NETWORK_TRACK: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        sample_type: SampleType::Int16,
        channels: 1,
    };

    pub fn new(sample_rate: u32, sample_type: SampleType, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(
                "sample rate must be positive".into(),
            ));
        }
        if !(1..=2).contains(&channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (only mono and stereo are supported)",
                channels
            )));
        }
        Ok(Self {
            sample_rate,
            sample_type,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.sample_type.bytes_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Number of whole frames in `len` bytes, or a `Format` error if `len`
    /// splits a frame.
    pub fn frames_in(&self, len: usize) -> Result<usize> {
        let frame = self.bytes_per_frame();
        if len % frame != 0 {
            return Err(AudioError::misaligned(len, self));
        }
        Ok(len / frame)
    }

    /// Frames covering `ms` milliseconds, rounded down.
    pub fn frames_for_ms(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }

    pub fn duration_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}/{}ch",
            self.sample_rate, self.sample_type, self.channels
        )
    }
}

/// Compressed containers the decode stage understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    OggOpus,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::OggOpus => write!(f, "ogg_opus"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    RawPcm,
    Compressed(Codec),
}

impl Encoding {
    /// Guess the encoding of the first bytes of a stream.
    ///
    /// An `OggS` capture pattern or an `OpusHead` marker near the start means
    /// OGG/Opus; anything else is PCM.
    pub fn sniff(data: &[u8]) -> Encoding {
        if data.len() < 4 {
            return Encoding::RawPcm;
        }
        if &data[..4] == b"OggS" {
            return Encoding::Compressed(Codec::OggOpus);
        }
        let head = &data[..data.len().min(64)];
        if head.windows(8).any(|w| w == b"OpusHead") {
            return Encoding::Compressed(Codec::OggOpus);
        }
        Encoding::RawPcm
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Encoding::Compressed(_))
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::RawPcm => write!(f, "raw_pcm"),
            Encoding::Compressed(codec) => write!(f, "compressed:{}", codec),
        }
    }
}

/// A contiguous slice of an audio stream.
///
/// The payload is reference counted and never mutated once built, so the
/// same chunk can be handed to several pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    data: Bytes,
    encoding: Encoding,
    format: Option<AudioFormat>,
}

impl AudioChunk {
    pub fn pcm(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            encoding: Encoding::RawPcm,
            format: Some(format),
        }
    }

    /// Compressed bytes; `hint` is whatever format the sender declared, if any.
    pub fn compressed(data: impl Into<Bytes>, codec: Codec, hint: Option<AudioFormat>) -> Self {
        Self {
            data: data.into(),
            encoding: Encoding::Compressed(codec),
            format: hint,
        }
    }

    pub fn from_i16(samples: &[i16], format: AudioFormat) -> Self {
        debug_assert_eq!(format.sample_type(), SampleType::Int16);
        Self::pcm(samples_to_bytes_i16(samples), format)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Format of a raw PCM chunk, validated against the payload length.
    pub fn pcm_format(&self) -> Result<AudioFormat> {
        if self.encoding != Encoding::RawPcm {
            return Err(AudioError::Format(format!(
                "expected raw PCM, got {}",
                self.encoding
            )));
        }
        let format = self
            .format
            .ok_or_else(|| AudioError::Format("raw PCM chunk without a format".into()))?;
        format.frames_in(self.data.len())?;
        Ok(format)
    }

    /// Whole frames in a raw PCM chunk.
    pub fn frame_count(&self) -> Result<usize> {
        let format = self.pcm_format()?;
        format.frames_in(self.data.len())
    }
}

pub fn samples_to_bytes_i16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub fn bytes_to_samples_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn samples_to_bytes_f32(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub fn bytes_to_samples_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono16(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, SampleType::Int16, 1).unwrap()
    }

    #[test]
    fn formats_are_compared_structurally() {
        assert_eq!(mono16(16_000), mono16(16_000));
        assert_ne!(mono16(16_000), mono16(24_000));
        assert_eq!(
            AudioFormat::new(48_000, SampleType::Int16, 1).unwrap(),
            AudioFormat::NETWORK_TRACK
        );
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        assert!(AudioFormat::new(48_000, SampleType::Float32, 0).is_err());
        assert!(AudioFormat::new(48_000, SampleType::Float32, 6).is_err());
        assert!(AudioFormat::new(0, SampleType::Float32, 1).is_err());
    }

    #[test]
    fn frame_geometry() {
        let stereo_f32 = AudioFormat::new(24_000, SampleType::Float32, 2).unwrap();
        assert_eq!(stereo_f32.bytes_per_frame(), 8);
        assert_eq!(stereo_f32.frames_in(80).unwrap(), 10);
        assert!(matches!(
            stereo_f32.frames_in(81),
            Err(AudioError::Format(_))
        ));
        assert_eq!(stereo_f32.frames_for_ms(20), 480);
    }

    #[test]
    fn pcm_chunk_with_split_frame_is_a_format_error() {
        let chunk = AudioChunk::pcm(vec![0u8; 3], mono16(16_000));
        assert!(matches!(chunk.pcm_format(), Err(AudioError::Format(_))));
    }

    #[test]
    fn sniff_detects_ogg_and_falls_back_to_pcm() {
        assert_eq!(
            Encoding::sniff(b"OggS\0\x02rest"),
            Encoding::Compressed(Codec::OggOpus)
        );
        let mut buf = vec![0u8; 40];
        buf[28..36].copy_from_slice(b"OpusHead");
        assert_eq!(Encoding::sniff(&buf), Encoding::Compressed(Codec::OggOpus));
        assert_eq!(Encoding::sniff(&[1, 2, 3]), Encoding::RawPcm);
        assert_eq!(Encoding::sniff(&[0u8; 128]), Encoding::RawPcm);
    }

    #[test]
    fn sample_bytes_are_little_endian() {
        let bytes = samples_to_bytes_i16(&[1, -2]);
        assert_eq!(bytes, vec![1, 0, 0xFE, 0xFF]);
        assert_eq!(bytes_to_samples_i16(&bytes), vec![1, -2]);
        let f = samples_to_bytes_f32(&[0.5]);
        assert_eq!(bytes_to_samples_f32(&f), vec![0.5]);
    }
}
