//! Ordered composition of stages ending in one sink.
//!
//! ```text
//! Building -> Ready -> Draining -> Closed
//! ```
//!
//! A pipeline is driven by exactly one thread. `Building` only exists when a
//! decoder has to read its stream header before the rest of the chain can be
//! chosen; the tail is then finalised from the first decoded chunk.

mod builder;

pub use builder::{PipelineBuilder, SourceSpec};

use std::fmt;

use crate::audio::format::{AudioChunk, AudioFormat};
use crate::audio::processor::{check_link, Port, Processor};
use crate::audio::resampler::ResampleStage;
use crate::audio::stream_decoder::DecodeStage;
use crate::error::{AudioError, Result};
use crate::sink::{Destination, SinkStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Building,
    Ready,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub chunks_in: u64,
    pub chunks_delivered: u64,
    pub frames_delivered: u64,
    /// Chunks lost to recoverable format errors.
    pub dropped_chunks: u64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in={} delivered={} frames={} dropped={}",
            self.chunks_in, self.chunks_delivered, self.frames_delivered, self.dropped_chunks
        )
    }
}

pub struct Pipeline {
    state: PipelineState,
    stages: Vec<Box<dyn Processor>>,
    /// Held until the decoder reveals its output format.
    pending_sink: Option<Box<dyn Destination>>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Fully specified pipeline: `stages` followed by the destination's sink.
    /// Every adjacent pair is checked here, never on the first chunk.
    pub fn from_stages(
        mut stages: Vec<Box<dyn Processor>>,
        destination: Box<dyn Destination>,
    ) -> Result<Self> {
        stages.push(Box::new(SinkStage::new(destination)));
        for pair in stages.windows(2) {
            check_link(pair[0].as_ref(), pair[1].as_ref())?;
        }
        let pipeline = Self {
            state: PipelineState::Ready,
            stages,
            pending_sink: None,
            stats: PipelineStats::default(),
        };
        log::info!("pipeline ready: {}", pipeline.describe());
        Ok(pipeline)
    }

    /// Decoder whose output format is not known yet. The resampler and sink
    /// are appended once the first PCM comes out of it.
    pub fn deferred(decoder: DecodeStage, destination: Box<dyn Destination>) -> Self {
        log::info!(
            "pipeline building: decode -> ? -> {} sink",
            destination.kind()
        );
        Self {
            state: PipelineState::Building,
            stages: vec![Box::new(decoder)],
            pending_sink: Some(destination),
            stats: PipelineStats::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Format delivered to the sink, once known.
    pub fn output_format(&self) -> Option<AudioFormat> {
        if self.pending_sink.is_some() {
            return None;
        }
        match self.stages.last().map(|s| s.input()) {
            Some(Port::Pcm(format)) => Some(format),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        self.stages
            .iter()
            .map(|s| format!("{}({})", s.name(), s.output()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Run one chunk through every stage in order.
    ///
    /// Malformed chunks are logged and dropped. Any other failure closes the
    /// pipeline and is returned.
    pub fn process(&mut self, chunk: AudioChunk) -> Result<()> {
        match self.state {
            PipelineState::Building | PipelineState::Ready => {}
            PipelineState::Draining | PipelineState::Closed => {
                return Err(AudioError::PipelineClosed);
            }
        }
        self.stats.chunks_in += 1;
        let result = self.run_from(0, chunk);
        self.settle(result)
    }

    /// End of stream: flush every stage in order, pushing flushed output
    /// through the stages after it, then close.
    pub fn end_stream(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Building | PipelineState::Ready => {}
            PipelineState::Draining | PipelineState::Closed => {
                return Err(AudioError::PipelineClosed);
            }
        }
        self.state = PipelineState::Draining;

        let mut index = 0;
        while index < self.stages.len() {
            let flushed = match self.stages[index].flush() {
                Ok(flushed) => flushed,
                Err(e) => {
                    self.settle(Err(e))?;
                    None
                }
            };
            if let Some(chunk) = flushed {
                let result = self.forward(index, chunk);
                self.settle(result)?;
            }
            index += 1;
        }

        if self.pending_sink.is_some() {
            log::warn!("stream ended before the decoder produced any audio");
        }
        log::info!("pipeline drained: {}", self.stats);
        self.close();
        Ok(())
    }

    /// Tear down immediately. Buffered audio is discarded, nothing is flushed.
    pub fn close(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        for stage in self.stages.iter_mut() {
            stage.close();
        }
        if let Some(mut destination) = self.pending_sink.take() {
            destination.close();
        }
        self.state = PipelineState::Closed;
        log::info!("pipeline closed ({})", self.stats);
    }

    fn settle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                self.stats.dropped_chunks += 1;
                log::warn!("dropping chunk: {}", e);
                Ok(())
            }
            Err(e) => {
                log::error!("pipeline stopped: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    /// Hand output of stage `index` to the stages after it.
    fn forward(&mut self, index: usize, chunk: AudioChunk) -> Result<()> {
        if self.pending_sink.is_some() {
            self.finalize(&chunk)?;
        }
        self.run_from(index + 1, chunk)
    }

    fn run_from(&mut self, start: usize, chunk: AudioChunk) -> Result<()> {
        let mut current = chunk;
        let mut index = start;
        while index < self.stages.len() {
            let at_sink = self.pending_sink.is_none() && index + 1 == self.stages.len();
            let frames = if at_sink { current.frame_count()? } else { 0 };

            let output = self.stages[index].process(current)?;
            if at_sink {
                self.stats.chunks_delivered += 1;
                self.stats.frames_delivered += frames as u64;
            }

            match output {
                Some(next) if index + 1 < self.stages.len() || self.pending_sink.is_some() => {
                    if self.pending_sink.is_some() {
                        self.finalize(&next)?;
                    }
                    current = next;
                }
                _ => return Ok(()),
            }
            index += 1;
        }
        Ok(())
    }

    /// Append resampler and sink now that the decoded format is known.
    ///
    /// A malformed first chunk leaves the destination pending. Once taken,
    /// the destination is always part of `stages`, so `close()` reaches it.
    fn finalize(&mut self, first: &AudioChunk) -> Result<()> {
        if self.pending_sink.is_none() {
            return Ok(());
        }
        let decoded = first.pcm_format()?;
        let Some(destination) = self.pending_sink.take() else {
            return Ok(());
        };
        let required = destination.required_format();

        let head = self.stages.len() - 1;
        if let Some(resample) = ResampleStage::between(decoded, required) {
            self.stages.push(Box::new(resample));
        }
        self.stages.push(Box::new(SinkStage::new(destination)));
        for pair in self.stages[head..].windows(2) {
            check_link(pair[0].as_ref(), pair[1].as_ref())?;
        }
        if self.state == PipelineState::Building {
            self.state = PipelineState::Ready;
        }
        log::info!("pipeline ready: {}", self.describe());
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{Codec, SampleType};
    use crate::audio::stream_decoder::StreamDecoder;
    use crate::sink::DestinationKind;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn fmt(rate: u32, ty: SampleType, ch: u16) -> AudioFormat {
        AudioFormat::new(rate, ty, ch).unwrap()
    }

    #[derive(Default)]
    struct Seen {
        chunks: Vec<Bytes>,
        flushes: usize,
        closes: usize,
    }

    struct Recorder {
        format: AudioFormat,
        seen: Arc<Mutex<Seen>>,
    }

    impl Destination for Recorder {
        fn kind(&self) -> DestinationKind {
            DestinationKind::NetworkTrack
        }

        fn required_format(&self) -> AudioFormat {
            self.format
        }

        fn deliver(&mut self, data: Bytes) -> Result<()> {
            self.seen.lock().unwrap().chunks.push(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.seen.lock().unwrap().flushes += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.seen.lock().unwrap().closes += 1;
        }
    }

    fn recorder(format: AudioFormat) -> (Box<dyn Destination>, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        (
            Box::new(Recorder {
                format,
                seen: seen.clone(),
            }),
            seen,
        )
    }

    /// Emits its input as PCM of `format` once it has seen `hold` chunks.
    struct HeaderDecoder {
        format: AudioFormat,
        known: bool,
        hold: usize,
        tail: Vec<u8>,
    }

    impl StreamDecoder for HeaderDecoder {
        fn codec(&self) -> Codec {
            Codec::OggOpus
        }

        fn output_format(&self) -> Option<AudioFormat> {
            self.known.then_some(self.format)
        }

        fn feed(&mut self, data: &[u8]) -> Result<Option<AudioChunk>> {
            if self.hold > 0 {
                self.hold -= 1;
                self.tail.extend_from_slice(data);
                return Ok(None);
            }
            self.known = true;
            let mut out = std::mem::take(&mut self.tail);
            out.extend_from_slice(data);
            Ok(Some(AudioChunk::pcm(out, self.format)))
        }

        fn flush(&mut self) -> Result<Option<AudioChunk>> {
            if self.tail.is_empty() {
                return Ok(None);
            }
            self.known = true;
            Ok(Some(AudioChunk::pcm(std::mem::take(&mut self.tail), self.format)))
        }
    }

    fn header_decoder(format: AudioFormat, hold: usize) -> DecodeStage {
        DecodeStage::new(Box::new(HeaderDecoder {
            format,
            known: false,
            hold,
            tail: Vec::new(),
        }))
    }

    fn ogg(data: &[u8]) -> AudioChunk {
        AudioChunk::compressed(data.to_vec(), Codec::OggOpus, None)
    }

    #[test]
    fn direct_pipeline_delivers_and_counts() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        let mut pipeline = Pipeline::from_stages(Vec::new(), dest).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["sink"]);

        pipeline.process(AudioChunk::pcm(vec![0u8; 8], f)).unwrap();
        pipeline.process(AudioChunk::pcm(vec![0u8; 3], f)).unwrap();
        pipeline.end_stream().unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.chunks_in, 2);
        assert_eq!(stats.chunks_delivered, 1);
        assert_eq!(stats.frames_delivered, 4);
        assert_eq!(stats.dropped_chunks, 1);
        assert_eq!(pipeline.state(), PipelineState::Closed);
        let seen = seen.lock().unwrap();
        assert_eq!((seen.chunks.len(), seen.flushes, seen.closes), (1, 1, 1));
    }

    #[test]
    fn mismatched_stages_fail_at_construction() {
        let resample = ResampleStage::new(
            fmt(48_000, SampleType::Int16, 1),
            fmt(16_000, SampleType::Int16, 1),
        );
        let (dest, _) = recorder(fmt(24_000, SampleType::Int16, 1));
        let err = Pipeline::from_stages(vec![Box::new(resample)], dest).err().unwrap();
        assert!(matches!(
            err,
            AudioError::IncompatibleStages {
                upstream: "resample",
                downstream: "sink",
                ..
            }
        ));
    }

    #[test]
    fn deferred_pipeline_finalises_on_first_output() {
        let decoded = fmt(48_000, SampleType::Int16, 2);
        let (dest, seen) = recorder(fmt(48_000, SampleType::Int16, 1));
        let mut pipeline = Pipeline::deferred(header_decoder(decoded, 1), dest);
        assert_eq!(pipeline.state(), PipelineState::Building);
        assert_eq!(pipeline.output_format(), None);

        pipeline.process(ogg(&[1, 0, 1, 0])).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Building);

        pipeline.process(ogg(&[3, 0, 3, 0])).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert_eq!(pipeline.stage_names(), vec!["decode", "resample", "sink"]);
        assert_eq!(pipeline.output_format(), Some(fmt(48_000, SampleType::Int16, 1)));
        assert_eq!(
            seen.lock().unwrap().chunks[0].as_ref(),
            &[1u8, 0, 3, 0][..]
        );
    }

    #[test]
    fn flushed_decoder_output_finalises_while_draining() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        let mut pipeline = Pipeline::deferred(header_decoder(f, 5), dest);
        pipeline.process(ogg(&[9, 0])).unwrap();
        pipeline.end_stream().unwrap();

        assert_eq!(pipeline.stage_names(), vec!["decode", "sink"]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.chunks.len(), 1);
        assert_eq!(seen.flushes, 1);
    }

    #[test]
    fn misaligned_first_output_keeps_the_sink_pending() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        let mut pipeline = Pipeline::deferred(header_decoder(f, 0), dest);

        pipeline.process(ogg(&[1, 2, 3])).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Building);
        assert_eq!(pipeline.stats().dropped_chunks, 1);

        for _ in 0..4 {
            pipeline.process(ogg(&[1, 0, 2, 0])).unwrap();
        }
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert_eq!(pipeline.stage_names(), vec!["decode", "sink"]);
        let stats = pipeline.stats();
        assert_eq!(stats.chunks_in, 5);
        assert_eq!(stats.chunks_delivered, 4);
        assert_eq!(stats.frames_delivered, 8);
        assert_eq!(stats.dropped_chunks, 1);

        pipeline.end_stream().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!((seen.chunks.len(), seen.flushes, seen.closes), (4, 1, 1));
    }

    #[test]
    fn unlinkable_tail_still_closes_the_destination() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        // The decoder has not announced a format yet, so nothing can follow it.
        let mut pipeline = Pipeline::deferred(header_decoder(f, 5), dest);

        let err = pipeline.finalize(&AudioChunk::pcm(vec![0u8; 4], f));
        assert!(matches!(err, Err(AudioError::IncompatibleStages { .. })));
        assert_eq!(pipeline.stage_names(), vec!["decode", "sink"]);

        pipeline.close();
        assert_eq!(seen.lock().unwrap().closes, 1);
    }

    #[test]
    fn stream_without_audio_closes_the_held_sink() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        let mut pipeline = Pipeline::deferred(header_decoder(f, 5), dest);
        pipeline.end_stream().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!((seen.flushes, seen.closes), (0, 1));
    }

    #[test]
    fn lifecycle_misuse_is_reported() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, _) = recorder(f);
        let mut pipeline = Pipeline::from_stages(Vec::new(), dest).unwrap();
        pipeline.close();
        assert!(matches!(
            pipeline.process(AudioChunk::pcm(vec![0u8; 2], f)),
            Err(AudioError::PipelineClosed)
        ));
        assert!(matches!(pipeline.end_stream(), Err(AudioError::PipelineClosed)));
    }

    #[test]
    fn malformed_input_is_dropped_and_drop_closes() {
        let f = fmt(16_000, SampleType::Int16, 1);
        let (dest, seen) = recorder(f);
        let mut pipeline = Pipeline::deferred(header_decoder(f, 0), dest);
        // A PCM chunk handed to the decoder is malformed input, not fatal.
        pipeline.process(AudioChunk::pcm(vec![0u8; 2], f)).unwrap();
        assert_eq!(pipeline.stats().dropped_chunks, 1);

        drop(pipeline);
        assert_eq!(seen.lock().unwrap().closes, 1);
    }
}
