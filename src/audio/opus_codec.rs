//! Opus stream headers and packet decoding.
//!
//! - `OpusHead`: identification header carried in the first OGG packet
//! - `OpusPacketDecoder`: libopus decoder producing 48 kHz interleaved i16

use bytes::{Buf, BufMut};

use crate::error::{AudioError, Result};

/// Opus always decodes at 48 kHz; the header's input rate is informational.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Largest packet duration allowed by Opus: 120 ms at 48 kHz.
const MAX_FRAME_SIZE: usize = 5760;

const HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const TAGS_MAGIC: &[u8; 8] = b"OpusTags";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    /// Samples (at 48 kHz) to discard from the start of the decoded stream.
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    /// Q7.8 dB gain to apply on output.
    pub output_gain: i16,
    pub mapping_family: u8,
}

impl OpusHead {
    pub fn new(channels: u8, pre_skip: u16, input_sample_rate: u32) -> Self {
        Self {
            version: 1,
            channels,
            pre_skip,
            input_sample_rate,
            output_gain: 0,
            mapping_family: 0,
        }
    }

    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < 19 || &packet[..8] != HEAD_MAGIC {
            return Err(AudioError::Decode(
                "first packet is not an OpusHead header".into(),
            ));
        }
        let mut buf = &packet[8..];
        let version = buf.get_u8();
        let channels = buf.get_u8();
        let pre_skip = buf.get_u16_le();
        let input_sample_rate = buf.get_u32_le();
        let output_gain = buf.get_i16_le();
        let mapping_family = buf.get_u8();

        // Only the major version (upper nibble) breaks compatibility.
        if version >> 4 != 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "Opus header version {}",
                version
            )));
        }
        if mapping_family != 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "Opus channel mapping family {}",
                mapping_family
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "Opus stream with {} channels",
                channels
            )));
        }

        Ok(Self {
            version,
            channels,
            pre_skip,
            input_sample_rate,
            output_gain,
            mapping_family,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19);
        out.put_slice(HEAD_MAGIC);
        out.put_u8(self.version);
        out.put_u8(self.channels);
        out.put_u16_le(self.pre_skip);
        out.put_u32_le(self.input_sample_rate);
        out.put_i16_le(self.output_gain);
        out.put_u8(self.mapping_family);
        out
    }
}

/// Comment header: recognised and skipped.
pub fn is_opus_tags(packet: &[u8]) -> bool {
    packet.len() >= 8 && &packet[..8] == TAGS_MAGIC
}

/// Minimal `OpusTags` packet with a vendor string and no comments.
pub fn opus_tags(vendor: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + vendor.len());
    out.put_slice(TAGS_MAGIC);
    out.put_u32_le(vendor.len() as u32);
    out.put_slice(vendor.as_bytes());
    out.put_u32_le(0);
    out
}

/// Turns one compressed packet into interleaved PCM.
pub trait PacketDecoder: Send {
    /// Append the decoded samples to `out`; returns frames decoded.
    fn decode(&mut self, packet: &[u8], out: &mut Vec<i16>) -> Result<usize>;
}

/// Builds the packet decoder once the stream header is known.
pub type DecoderFactory = Box<dyn Fn(&OpusHead) -> Result<Box<dyn PacketDecoder>> + Send>;

pub struct OpusPacketDecoder {
    decoder: opus::Decoder,
    channels: usize,
    pcm_buf: Vec<i16>,
}

impl OpusPacketDecoder {
    pub fn new(head: &OpusHead) -> Result<Self> {
        let channels = if head.channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let mut decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, channels)
            .map_err(|e| AudioError::Decode(format!("failed to create Opus decoder: {}", e)))?;
        if head.output_gain != 0 {
            decoder
                .set_gain(head.output_gain as i32)
                .map_err(|e| AudioError::Decode(format!("failed to set output gain: {}", e)))?;
        }
        Ok(Self {
            decoder,
            channels: head.channels as usize,
            pcm_buf: vec![0i16; MAX_FRAME_SIZE * head.channels as usize],
        })
    }

    pub fn factory() -> DecoderFactory {
        Box::new(|head| Ok(Box::new(OpusPacketDecoder::new(head)?) as Box<dyn PacketDecoder>))
    }
}

impl PacketDecoder for OpusPacketDecoder {
    fn decode(&mut self, packet: &[u8], out: &mut Vec<i16>) -> Result<usize> {
        let frames = self
            .decoder
            .decode(packet, &mut self.pcm_buf, false)
            .map_err(|e| AudioError::Decode(format!("Opus packet rejected: {}", e)))?;
        out.extend_from_slice(&self.pcm_buf[..frames * self.channels]);
        Ok(frames)
    }
}
