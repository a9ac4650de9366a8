//! Combined rate, sample-type and channel conversion stage.
//!
//! Rate conversion uses a windowed-sinc filter from rubato, which low-passes
//! below the lower of the two Nyquist limits before decimating. One filter
//! runs for the whole stream so chunk boundaries are seamless. Input that does
//! not fill a whole filter block waits for the next chunk, and the filter
//! delay is drained on `flush()`. Over a complete stream the output holds
//! round(frames × to / from) frames, aligned with the input.

use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use super::convert::{convert_channels, decode_samples, deinterleave, encode_samples, interleave};
use super::format::{AudioChunk, AudioFormat};
use super::processor::{Port, Processor};
use crate::error::{AudioError, Result};

/// Smallest filter block, in input frames.
const MIN_BLOCK_FRAMES: usize = 160;

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Frames produced for `frames` input frames, rounded to nearest.
pub fn output_frames(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    let num = frames as u64 * to_rate as u64 + from_rate as u64 / 2;
    (num / from_rate as u64) as usize
}

fn resample_error(e: impl std::fmt::Display) -> AudioError {
    AudioError::Format(format!("resampling failed: {}", e))
}

/// Stream state of one rate conversion: the rubato filter plus the input
/// that has not filled a block yet.
struct SincEngine {
    resampler: SincFixedIn<f32>,
    from_rate: u32,
    to_rate: u32,
    /// Planar input waiting for a full block.
    carry: Vec<Vec<f32>>,
    frames_in: usize,
    frames_out: usize,
}

impl SincEngine {
    fn new(from: AudioFormat, to: AudioFormat, channels: usize) -> Result<Self> {
        let ratio = to.sample_rate() as f64 / from.sample_rate() as f64;
        // 10 ms blocks keep the held input small.
        let block = (from.sample_rate() as usize / 100).max(MIN_BLOCK_FRAMES);
        let resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_parameters(), block, channels)
            .map_err(|e| {
                AudioError::UnsupportedFormat(format!("cannot resample {} -> {}: {}", from, to, e))
            })?;
        // Output is aligned with the input; `output_delay` is how far
        // emission trails it.
        log::debug!(
            "resampler ready: {}Hz -> {}Hz, block={} frames, latency={} frames",
            from.sample_rate(),
            to.sample_rate(),
            block,
            resampler.output_delay()
        );
        Ok(Self {
            resampler,
            from_rate: from.sample_rate(),
            to_rate: to.sample_rate(),
            carry: vec![Vec::with_capacity(block * 2); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Queue `planar` input and run every complete block.
    fn push(&mut self, planar: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        self.frames_in += planar.first().map_or(0, Vec::len);
        for (held, new) in self.carry.iter_mut().zip(planar) {
            held.extend_from_slice(new);
        }

        let mut out = vec![Vec::new(); self.carry.len()];
        let block = self.resampler.input_frames_next();
        let mut offset = 0;
        while self.carry[0].len() - offset >= block {
            let input: Vec<&[f32]> = self
                .carry
                .iter()
                .map(|ch| &ch[offset..offset + block])
                .collect();
            let produced = self
                .resampler
                .process(&input[..], None)
                .map_err(resample_error)?;
            append_planar(&mut out, produced);
            offset += block;
        }
        for held in self.carry.iter_mut() {
            held.drain(..offset);
        }
        Ok(self.settle(out))
    }

    /// End of stream: run the held input and push silence through until the
    /// delayed tail is out.
    fn drain(&mut self) -> Result<Vec<Vec<f32>>> {
        let target = output_frames(self.frames_in, self.from_rate, self.to_rate);
        let mut out = vec![Vec::new(); self.carry.len()];

        if !self.carry[0].is_empty() {
            let produced = self
                .resampler
                .process_partial(Some(self.carry.as_slice()), None)
                .map_err(resample_error)?;
            append_planar(&mut out, produced);
            for held in self.carry.iter_mut() {
                held.clear();
            }
        }
        while self.frames_out + out[0].len() < target {
            let produced = self
                .resampler
                .process_partial::<Vec<f32>>(None, None)
                .map_err(resample_error)?;
            if produced.first().is_none_or(|ch| ch.is_empty()) {
                break;
            }
            append_planar(&mut out, produced);
        }
        Ok(self.settle(out))
    }

    /// Never emit more than the input so far accounts for.
    fn settle(&mut self, mut out: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
        let target = output_frames(self.frames_in, self.from_rate, self.to_rate);
        let room = target.saturating_sub(self.frames_out);
        for channel in out.iter_mut() {
            channel.truncate(room);
        }
        self.frames_out += out.first().map_or(0, Vec::len);
        out
    }
}

fn append_planar(into: &mut [Vec<f32>], from: Vec<Vec<f32>>) {
    for (dst, src) in into.iter_mut().zip(from) {
        dst.extend_from_slice(&src);
    }
}

pub struct ResampleStage {
    from: AudioFormat,
    to: AudioFormat,
    engine: Option<SincEngine>,
}

impl ResampleStage {
    pub fn new(from: AudioFormat, to: AudioFormat) -> Self {
        Self {
            from,
            to,
            engine: None,
        }
    }

    /// A stage converting `from` into `to`, or `None` if they already match.
    pub fn between(from: AudioFormat, to: AudioFormat) -> Option<Self> {
        (from != to).then(|| Self::new(from, to))
    }

    fn changes_rate(&self) -> bool {
        self.from.sample_rate() != self.to.sample_rate()
    }

    /// The filter always runs on the smaller channel count.
    fn filter_channels(&self) -> usize {
        self.from.channels().min(self.to.channels()) as usize
    }

    fn engine(&mut self) -> Result<&mut SincEngine> {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => SincEngine::new(self.from, self.to, self.filter_channels())?,
        };
        Ok(self.engine.insert(engine))
    }

    /// Upmix if needed and encode as the target sample type.
    fn finish(&self, mut samples: Vec<f32>) -> AudioChunk {
        let from_ch = self.from.channels();
        let to_ch = self.to.channels();
        if to_ch > from_ch {
            samples = convert_channels(&samples, from_ch, to_ch);
        }
        AudioChunk::pcm(encode_samples(&samples, self.to.sample_type()), self.to)
    }

    fn finish_planar(&self, planar: Vec<Vec<f32>>) -> Option<AudioChunk> {
        if planar.first().is_none_or(|ch| ch.is_empty()) {
            return None;
        }
        Some(self.finish(interleave(&planar)))
    }
}

impl Processor for ResampleStage {
    fn name(&self) -> &'static str {
        "resample"
    }

    fn input(&self) -> Port {
        Port::Pcm(self.from)
    }

    fn output(&self) -> Port {
        Port::Pcm(self.to)
    }

    /// `None` while the filter is still collecting its first block.
    fn process(&mut self, chunk: AudioChunk) -> Result<Option<AudioChunk>> {
        let format = chunk.pcm_format()?;
        if format != self.from {
            return Err(AudioError::Format(format!(
                "resampler expects {}, chunk is {}",
                self.from, format
            )));
        }
        if chunk.is_empty() {
            return Ok(Some(AudioChunk::pcm(Vec::new(), self.to)));
        }

        let from_ch = self.from.channels();
        let to_ch = self.to.channels();
        let mut samples = decode_samples(chunk.data(), self.from.sample_type());
        if to_ch < from_ch {
            samples = convert_channels(&samples, from_ch, to_ch);
        }
        if !self.changes_rate() {
            return Ok(Some(self.finish(samples)));
        }

        let planar = deinterleave(&samples, self.filter_channels());
        let out = self.engine()?.push(&planar)?;
        Ok(self.finish_planar(out))
    }

    fn flush(&mut self) -> Result<Option<AudioChunk>> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(None);
        };
        let out = engine.drain()?;
        Ok(self.finish_planar(out))
    }

    fn close(&mut self) {
        self.engine = None;
    }
}
