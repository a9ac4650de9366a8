//! Chooses the minimal stage list for one source/destination pair.

use super::Pipeline;
use crate::audio::format::{AudioFormat, Codec, Encoding};
use crate::audio::processor::{Port, Processor};
use crate::audio::resampler::ResampleStage;
use crate::audio::stream_decoder::{create_decoder, DecodeStage, StreamDecoder};
use crate::error::{AudioError, Result};
use crate::sink::Destination;

/// What the upstream source declared about its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpec {
    pub encoding: Encoding,
    /// Required for raw PCM; only a hint for compressed streams.
    pub format: Option<AudioFormat>,
}

impl SourceSpec {
    pub fn pcm(format: AudioFormat) -> Self {
        Self {
            encoding: Encoding::RawPcm,
            format: Some(format),
        }
    }

    pub fn compressed(codec: Codec, hint: Option<AudioFormat>) -> Self {
        Self {
            encoding: Encoding::Compressed(codec),
            format: hint,
        }
    }
}

/// Builds `[decode] -> [resample] -> sink`.
///
/// Decode comes first when the source is compressed. A single resample stage
/// covers any mix of rate, sample type and channel differences and always
/// sits directly before the sink.
pub struct PipelineBuilder {
    source: SourceSpec,
    block_ms: u32,
    decoder: Option<Box<dyn StreamDecoder>>,
}

impl PipelineBuilder {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            block_ms: 20,
            decoder: None,
        }
    }

    /// Granularity of decoder output.
    pub fn block_ms(mut self, block_ms: u32) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Use this decoder instead of the one matching the source codec.
    pub fn decoder(mut self, decoder: Box<dyn StreamDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn build(self, destination: Box<dyn Destination>) -> Result<Pipeline> {
        let required = destination.required_format();
        match self.source.encoding {
            Encoding::RawPcm => {
                let format = self.source.format.ok_or_else(|| {
                    AudioError::UnsupportedFormat("raw PCM source without a declared format".into())
                })?;
                let stages: Vec<Box<dyn Processor>> = ResampleStage::between(format, required)
                    .map(|stage| Box::new(stage) as Box<dyn Processor>)
                    .into_iter()
                    .collect();
                Pipeline::from_stages(stages, destination)
            }
            Encoding::Compressed(codec) => {
                let decoder = self
                    .decoder
                    .unwrap_or_else(|| create_decoder(codec, self.block_ms));
                if decoder.codec() != codec {
                    return Err(AudioError::UnsupportedFormat(format!(
                        "source is {} but decoder handles {}",
                        codec,
                        decoder.codec()
                    )));
                }
                let decode = DecodeStage::new(decoder);
                match decode.output() {
                    Port::Pcm(decoded) => {
                        let mut stages: Vec<Box<dyn Processor>> = vec![Box::new(decode)];
                        if let Some(resample) = ResampleStage::between(decoded, required) {
                            stages.push(Box::new(resample));
                        }
                        Pipeline::from_stages(stages, destination)
                    }
                    _ => Ok(Pipeline::deferred(decode, destination)),
                }
            }
        }
    }
}
