//! Incremental decoding of compressed streams into PCM.

use super::format::{AudioChunk, AudioFormat, Codec, Encoding, SampleType};
use super::ogg::{Packet, PacketAssembler, PageReader};
use super::opus_codec::{
    is_opus_tags, DecoderFactory, OpusHead, OpusPacketDecoder, PacketDecoder, OPUS_SAMPLE_RATE,
};
use super::processor::{Port, Processor};
use crate::error::{AudioError, Result};

/// A stateful decoder fed with arbitrarily sized slices of a compressed
/// stream. Output format is dictated by the stream itself.
pub trait StreamDecoder: Send {
    fn codec(&self) -> Codec;

    /// `None` until the stream header has been parsed.
    fn output_format(&self) -> Option<AudioFormat>;

    /// Buffer `data` and decode every complete frame.
    fn feed(&mut self, data: &[u8]) -> Result<Option<AudioChunk>>;

    /// End of stream: release everything still held back.
    fn flush(&mut self) -> Result<Option<AudioChunk>>;

    fn close(&mut self) {}
}

/// Factory: create a decoder for the declared codec.
pub fn create_decoder(codec: Codec, block_ms: u32) -> Box<dyn StreamDecoder> {
    match codec {
        Codec::OggOpus => Box::new(OggOpusDecoder::new(block_ms)),
    }
}

/// OGG-encapsulated Opus.
///
/// Output is 48 kHz interleaved int16 with the channel count from `OpusHead`.
/// Pre-skip is removed from the head of the stream and the final granule
/// position trims encoder padding at the tail. PCM is released in whole
/// blocks of `block_ms`; the remainder waits for more input or `flush()`.
pub struct OggOpusDecoder {
    reader: PageReader,
    assembler: PacketAssembler,
    factory: DecoderFactory,
    decoder: Option<Box<dyn PacketDecoder>>,
    head: Option<OpusHead>,
    format: Option<AudioFormat>,
    tags_seen: bool,
    ended: bool,
    block_ms: u32,
    /// Frames decoded since the start of the stream, pre-skip included.
    position: u64,
    skip_remaining: usize,
    pending: Vec<i16>,
}

impl OggOpusDecoder {
    pub fn new(block_ms: u32) -> Self {
        Self::with_factory(block_ms, OpusPacketDecoder::factory())
    }

    pub fn with_factory(block_ms: u32, factory: DecoderFactory) -> Self {
        Self {
            reader: PageReader::new(),
            assembler: PacketAssembler::new(),
            factory,
            decoder: None,
            head: None,
            format: None,
            tags_seen: false,
            ended: false,
            block_ms,
            position: 0,
            skip_remaining: 0,
            pending: Vec::new(),
        }
    }

    pub fn head(&self) -> Option<&OpusHead> {
        self.head.as_ref()
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        if self.ended {
            log::warn!("ignoring {} bytes after end of Opus stream", packet.data.len());
            return Ok(());
        }

        let channels = self.channels();
        let Some(decoder) = self.decoder.as_mut() else {
            let head = OpusHead::parse(&packet.data)?;
            let format =
                AudioFormat::new(OPUS_SAMPLE_RATE, SampleType::Int16, head.channels as u16)?;
            log::info!(
                "Opus stream: channels={}, pre_skip={}, input_rate={}Hz, gain={}",
                head.channels,
                head.pre_skip,
                head.input_sample_rate,
                head.output_gain
            );
            self.decoder = Some((self.factory)(&head)?);
            self.skip_remaining = head.pre_skip as usize;
            self.format = Some(format);
            self.head = Some(head);
            return Ok(());
        };

        if !self.tags_seen {
            if !is_opus_tags(&packet.data) {
                return Err(AudioError::Decode(
                    "expected OpusTags after OpusHead".into(),
                ));
            }
            self.tags_seen = true;
            return Ok(());
        }

        let frames = decoder.decode(&packet.data, &mut self.pending)?;
        self.position += frames as u64;

        if packet.last_in_stream {
            self.ended = true;
            if let Some(end) = packet.granule_position {
                let end = end.max(0) as u64;
                if self.position > end {
                    let excess = ((self.position - end) as usize).min(frames);
                    let keep = self.pending.len() - excess * channels;
                    self.pending.truncate(keep);
                    self.position -= excess as u64;
                }
            }
        }

        if self.skip_remaining > 0 {
            let skip = self.skip_remaining.min(self.pending.len() / channels);
            self.pending.drain(..skip * channels);
            self.skip_remaining -= skip;
        }
        Ok(())
    }

    fn channels(&self) -> usize {
        self.format.map_or(1, |f| f.channels() as usize)
    }

    fn release(&mut self, everything: bool) -> Option<AudioChunk> {
        let format = self.format?;
        let channels = format.channels() as usize;
        let frames = self.pending.len() / channels;
        let block = format.frames_for_ms(self.block_ms).max(1);
        let take = if everything {
            frames
        } else {
            frames / block * block
        };
        if take == 0 {
            return None;
        }
        let samples: Vec<i16> = self.pending.drain(..take * channels).collect();
        Some(AudioChunk::from_i16(&samples, format))
    }
}

impl StreamDecoder for OggOpusDecoder {
    fn codec(&self) -> Codec {
        Codec::OggOpus
    }

    fn output_format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn feed(&mut self, data: &[u8]) -> Result<Option<AudioChunk>> {
        self.reader.push(data);
        while let Some(page) = self.reader.next_page()? {
            for packet in self.assembler.push_page(&page)? {
                self.handle_packet(packet)?;
            }
        }
        Ok(self.release(false))
    }

    fn flush(&mut self) -> Result<Option<AudioChunk>> {
        if self.reader.buffered() > 0 {
            log::warn!(
                "discarding {} bytes of an incomplete OGG page at end of stream",
                self.reader.buffered()
            );
        }
        if self.assembler.has_partial() {
            log::warn!("discarding an unfinished Opus packet at end of stream");
        }
        Ok(self.release(true))
    }

    fn close(&mut self) {
        self.decoder = None;
        self.pending.clear();
        self.pending.shrink_to_fit();
    }
}

/// Pipeline stage wrapping a [`StreamDecoder`].
pub struct DecodeStage {
    decoder: Box<dyn StreamDecoder>,
}

impl DecodeStage {
    pub fn new(decoder: Box<dyn StreamDecoder>) -> Self {
        Self { decoder }
    }
}

impl Processor for DecodeStage {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn input(&self) -> Port {
        Port::Compressed(self.decoder.codec())
    }

    fn output(&self) -> Port {
        match self.decoder.output_format() {
            Some(format) => Port::Pcm(format),
            None => Port::Pending,
        }
    }

    fn process(&mut self, chunk: AudioChunk) -> Result<Option<AudioChunk>> {
        let expected = Encoding::Compressed(self.decoder.codec());
        if chunk.encoding() != expected {
            return Err(AudioError::Format(format!(
                "decoder expects {}, chunk is {}",
                expected,
                chunk.encoding()
            )));
        }
        self.decoder.feed(chunk.data())
    }

    fn flush(&mut self) -> Result<Option<AudioChunk>> {
        self.decoder.flush()
    }

    fn close(&mut self) {
        self.decoder.close();
    }
}
