//! audio - PCM formats, codecs and conversion stages
//!
//! Everything here is pure in-process transformation except `alsa_device`,
//! which opens the playback hardware for the speaker sink.

pub(crate) mod alsa_device;
pub mod convert;
pub mod format;
pub mod ogg;
pub mod opus_codec;
pub mod processor;
pub mod resampler;
pub mod stream_decoder;

pub use format::{AudioChunk, AudioFormat, Codec, Encoding, SampleType};
pub use processor::{Port, Processor};
pub use resampler::ResampleStage;
pub use stream_decoder::{DecodeStage, OggOpusDecoder, StreamDecoder};
