//! Fan-out from the upstream source to one pipeline per destination.
//!
//! Each destination has an [`OutputWorker`] on its own OS thread (blocking
//! device writes must not stall the async runtime). The router hands every
//! worker a clone of the same immutable `Bytes`; the workers own all mutable
//! state.

use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::format::{AudioChunk, AudioFormat, Encoding};
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStats, SourceSpec};
use crate::sink::Destination;

/// Opens the destination for a new stream.
pub type DestinationFactory = Box<dyn FnMut() -> Result<Box<dyn Destination>> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Started {
        destination: String,
        stream: Uuid,
        stages: Vec<&'static str>,
    },
    Drained {
        destination: String,
        stream: Uuid,
        stats: PipelineStats,
    },
    /// The destination receives nothing more from this stream.
    Failed {
        destination: String,
        stream: Uuid,
        error: String,
    },
}

enum WorkerMessage {
    Chunk {
        stream: Uuid,
        source: SourceSpec,
        data: Bytes,
    },
    EndStream {
        stream: Uuid,
    },
    Shutdown,
}

struct ActiveStream {
    id: Uuid,
    /// `None` after a stream-fatal error.
    pipeline: Option<Pipeline>,
}

struct WorkerContext {
    name: String,
    factory: DestinationFactory,
    block_ms: u32,
    events: Option<mpsc::UnboundedSender<OutputEvent>>,
}

impl WorkerContext {
    fn emit(&self, event: OutputEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn fail(&self, stream: Uuid, error: String) {
        log::error!("[{}] stream {} stopped: {}", self.name, stream, error);
        self.emit(OutputEvent::Failed {
            destination: self.name.clone(),
            stream,
            error,
        });
    }

    fn start(&mut self, stream: Uuid, source: SourceSpec) -> ActiveStream {
        let built = (self.factory)().and_then(|destination| {
            PipelineBuilder::new(source)
                .block_ms(self.block_ms)
                .build(destination)
        });
        let pipeline = match built {
            Ok(pipeline) => {
                log::info!(
                    "[{}] stream {} started: {:?}",
                    self.name,
                    stream,
                    pipeline.stage_names()
                );
                self.emit(OutputEvent::Started {
                    destination: self.name.clone(),
                    stream,
                    stages: pipeline.stage_names(),
                });
                Some(pipeline)
            }
            Err(e) => {
                self.fail(stream, e.to_string());
                None
            }
        };
        ActiveStream {
            id: stream,
            pipeline,
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        let mut active: Option<ActiveStream> = None;

        while let Some(message) = rx.blocking_recv() {
            match message {
                WorkerMessage::Chunk {
                    stream,
                    source,
                    data,
                } => {
                    if active.as_ref().is_none_or(|a| a.id != stream) {
                        // A new stream without end_stream for the old one.
                        active = Some(self.start(stream, source));
                    }
                    let Some(current) = active.as_mut() else {
                        continue;
                    };
                    let Some(pipeline) = current.pipeline.as_mut() else {
                        continue;
                    };
                    let chunk = match source.encoding {
                        Encoding::RawPcm => match source.format {
                            Some(format) => AudioChunk::pcm(data, format),
                            None => continue,
                        },
                        Encoding::Compressed(codec) => {
                            AudioChunk::compressed(data, codec, source.format)
                        }
                    };
                    if let Err(e) = pipeline.process(chunk) {
                        current.pipeline = None;
                        self.fail(stream, e.to_string());
                    }
                }
                WorkerMessage::EndStream { stream } => {
                    let Some(mut current) = active.take() else {
                        continue;
                    };
                    if current.id != stream {
                        log::warn!("[{}] end of unknown stream {}", self.name, stream);
                        continue;
                    }
                    let Some(mut pipeline) = current.pipeline.take() else {
                        continue;
                    };
                    match pipeline.end_stream() {
                        Ok(()) => {
                            log::info!("[{}] stream {} drained", self.name, stream);
                            self.emit(OutputEvent::Drained {
                                destination: self.name.clone(),
                                stream,
                                stats: pipeline.stats(),
                            });
                        }
                        Err(e) => self.fail(stream, e.to_string()),
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }

        // Abrupt: whatever is buffered is discarded.
        if let Some(mut current) = active.take() {
            if let Some(pipeline) = current.pipeline.as_mut() {
                pipeline.close();
            }
        }
        log::info!("[{}] output worker stopped", self.name);
    }
}

/// One destination's thread and its inbox.
pub struct OutputWorker {
    name: String,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl OutputWorker {
    fn spawn(context: WorkerContext) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = context.name.clone();
        let thread = thread::Builder::new()
            .name(format!("audio-out-{}", name))
            .spawn(move || context.run(rx))?;
        Ok(Self {
            name,
            tx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: WorkerMessage) {
        if self.tx.send(message).is_err() {
            log::warn!("[{}] output worker is gone", self.name);
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[{}] output worker panicked", self.name);
            }
        }
    }
}

struct StreamState {
    id: Uuid,
    encoding: Encoding,
}

/// Entry point for upstream audio.
pub struct AudioRouter {
    workers: Vec<OutputWorker>,
    default_format: Option<AudioFormat>,
    block_ms: u32,
    events: Option<mpsc::UnboundedSender<OutputEvent>>,
    stream: Option<StreamState>,
}

impl AudioRouter {
    /// `default_format` is used for chunks that arrive without a format hint.
    pub fn new(default_format: Option<AudioFormat>, block_ms: u32) -> Self {
        Self {
            workers: Vec::new(),
            default_format,
            block_ms,
            events: None,
            stream: None,
        }
    }

    /// Like `new`, also returning the receiver for worker events.
    pub fn with_events(
        default_format: Option<AudioFormat>,
        block_ms: u32,
    ) -> (Self, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut router = Self::new(default_format, block_ms);
        router.events = Some(tx);
        (router, rx)
    }

    pub fn add_destination(
        &mut self,
        name: impl Into<String>,
        factory: DestinationFactory,
    ) -> anyhow::Result<()> {
        let name = name.into();
        let worker = OutputWorker::spawn(WorkerContext {
            name: name.clone(),
            factory,
            block_ms: self.block_ms,
            events: self.events.clone(),
        })
        .map_err(|e| anyhow::anyhow!("Failed to spawn output worker '{}': {}", name, e))?;
        log::info!("output worker '{}' started", worker.name());
        self.workers.push(worker);
        Ok(())
    }

    pub fn destinations(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// Current stream id, if a stream is in progress.
    pub fn stream_id(&self) -> Option<Uuid> {
        self.stream.as_ref().map(|s| s.id)
    }

    /// Hand one upstream message to every destination.
    ///
    /// The first chunk of a stream fixes its encoding; with `encoding` of
    /// `None` it is sniffed from the bytes.
    pub fn feed_chunk(
        &mut self,
        format_hint: Option<AudioFormat>,
        encoding: Option<Encoding>,
        data: impl Into<Bytes>,
    ) {
        let data = data.into();
        let stream = self.stream.get_or_insert_with(|| {
            let encoding = encoding.unwrap_or_else(|| Encoding::sniff(&data));
            let id = Uuid::new_v4();
            log::info!("stream {} begins: {}", id, encoding);
            StreamState { id, encoding }
        });
        if let Some(declared) = encoding {
            if declared != stream.encoding {
                log::warn!(
                    "stream {} is {}, ignoring chunk tagged {}",
                    stream.id,
                    stream.encoding,
                    declared
                );
                return;
            }
        }

        let source = SourceSpec {
            encoding: stream.encoding,
            format: format_hint.or(self.default_format),
        };
        let id = stream.id;
        for worker in &self.workers {
            worker.send(WorkerMessage::Chunk {
                stream: id,
                source,
                data: data.clone(),
            });
        }
    }

    /// The upstream source finished the current stream.
    pub fn end_stream(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        log::info!("stream {} ends", stream.id);
        for worker in &self.workers {
            worker.send(WorkerMessage::EndStream { stream: stream.id });
        }
    }

    /// Stop every worker after it has handled what is already queued.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.send(WorkerMessage::Shutdown);
        }
        for worker in self.workers.iter_mut() {
            worker.join();
        }
        self.workers.clear();
    }
}

impl Drop for AudioRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
