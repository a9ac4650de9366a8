//! Adapts one upstream voice stream to heterogeneous outputs.
//!
//! Upstream chunks (raw PCM or OGG/Opus) enter through [`AudioRouter`], which
//! fans them out to one [`Pipeline`] per destination:
//!
//! ```text
//! [decode] -> [resample] -> sink (speaker | network track)
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod router;
pub mod sink;

pub use audio::{AudioChunk, AudioFormat, Codec, Encoding, SampleType};
pub use config::Config;
pub use error::{AudioError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineState, PipelineStats, SourceSpec};
pub use router::{AudioRouter, DestinationFactory, OutputEvent};
pub use sink::{Destination, DestinationKind};
