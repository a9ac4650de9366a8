//! Outgoing network audio track.
//!
//! The track carries fixed-size frames of 48 kHz mono int16. The producing
//! side never waits: a full queue loses its oldest frame. The consuming side
//! paces the peer connection and fills gaps with silence.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::{Destination, DestinationKind};
use crate::audio::format::AudioFormat;
use crate::error::{AudioError, Result};

pub const DEFAULT_QUEUE_FRAMES: usize = 200;
pub const DEFAULT_FRAME_MS: u32 = 20;

struct TrackQueue {
    frames: VecDeque<Bytes>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

struct TrackShared {
    queue: Mutex<TrackQueue>,
    notify: Notify,
}

impl TrackShared {
    fn lock(&self) -> MutexGuard<'_, TrackQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        let mut queue = self.lock();
        if !queue.closed {
            queue.closed = true;
            queue.frames.clear();
            drop(queue);
            self.notify.notify_one();
        }
    }
}

/// Create a track holding at most `capacity` frames of `frame_ms` each.
pub fn track_channel(capacity: usize, frame_ms: u32) -> (TrackHandle, TrackReceiver) {
    let format = AudioFormat::NETWORK_TRACK;
    let frame_samples = format.frames_for_ms(frame_ms).max(1);
    let frame_bytes = frame_samples * format.bytes_per_frame();
    let shared = Arc::new(TrackShared {
        queue: Mutex::new(TrackQueue {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
    });

    let handle = TrackHandle {
        shared: shared.clone(),
        frame_bytes,
    };
    let receiver = TrackReceiver {
        shared,
        frame_bytes,
        frame_samples,
        period: Duration::from_millis(frame_ms as u64),
        pts: 0,
    };
    (handle, receiver)
}

/// Producer side of a track; cheap to clone. Each stream gets its own
/// [`NetworkTrackSink`] from [`TrackHandle::sink`].
#[derive(Clone)]
pub struct TrackHandle {
    shared: Arc<TrackShared>,
    frame_bytes: usize,
}

impl TrackHandle {
    pub fn sink(&self) -> NetworkTrackSink {
        NetworkTrackSink {
            handle: self.clone(),
            partial: BytesMut::with_capacity(self.frame_bytes),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Frames discarded because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.lock().dropped
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.lock().frames.len()
    }

    /// Tear the track down; the receiver sees end of track.
    pub fn close(&self) {
        self.shared.close();
    }

    fn push(&self, frame: Bytes) -> Result<()> {
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(AudioError::SinkClosed("network track closed".into()));
        }
        if queue.frames.len() >= queue.capacity {
            queue.frames.pop_front();
            queue.dropped += 1;
            if queue.dropped == 1 || queue.dropped % 100 == 0 {
                log::debug!(
                    "network track queue full, {} frames dropped so far",
                    queue.dropped
                );
            }
        }
        queue.frames.push_back(frame);
        drop(queue);
        self.shared.notify.notify_one();
        Ok(())
    }
}

/// Splits PCM into track frames and enqueues them without blocking.
pub struct NetworkTrackSink {
    handle: TrackHandle,
    partial: BytesMut,
}

impl Destination for NetworkTrackSink {
    fn kind(&self) -> DestinationKind {
        DestinationKind::NetworkTrack
    }

    fn required_format(&self) -> AudioFormat {
        AudioFormat::NETWORK_TRACK
    }

    fn deliver(&mut self, data: Bytes) -> Result<()> {
        if self.handle.is_closed() {
            self.partial.clear();
            return Err(AudioError::SinkClosed("network track closed".into()));
        }
        self.partial.extend_from_slice(&data);
        let frame_bytes = self.handle.frame_bytes;
        while self.partial.len() >= frame_bytes {
            let frame = self.partial.split_to(frame_bytes).freeze();
            self.handle.push(frame)?;
        }
        Ok(())
    }

    /// Pads the last partial frame with silence.
    fn flush(&mut self) -> Result<()> {
        if self.partial.is_empty() {
            return Ok(());
        }
        self.partial.resize(self.handle.frame_bytes, 0);
        let frame = self.partial.split().freeze();
        self.handle.push(frame)
    }

    /// Detaches this stream; the track itself stays open for the next one.
    fn close(&mut self) {
        self.partial.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackFrame {
    /// Presentation time in samples, time base 1/48000.
    pub pts: u64,
    pub data: Bytes,
    /// Generated because nothing arrived within one frame period.
    pub silence: bool,
}

/// Consumer side, driven by whatever sends frames to the peer.
///
/// Dropping the receiver closes the track.
pub struct TrackReceiver {
    shared: Arc<TrackShared>,
    frame_bytes: usize,
    frame_samples: usize,
    period: Duration,
    pts: u64,
}

impl TrackReceiver {
    /// Next frame, or a silence frame if none arrives within one period.
    /// `None` once the track is closed.
    pub async fn recv(&mut self) -> Option<TrackFrame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.shared.lock().closed {
                return None;
            }
            match tokio::time::timeout(self.period, self.shared.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => {
                    let silence = Bytes::from(vec![0u8; self.frame_bytes]);
                    return Some(self.stamp(silence, true));
                }
            }
        }
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<TrackFrame> {
        let frame = self.shared.lock().frames.pop_front()?;
        Some(self.stamp(frame, false))
    }

    pub fn close(&mut self) {
        self.shared.close();
    }

    fn stamp(&mut self, data: Bytes, silence: bool) -> TrackFrame {
        let frame = TrackFrame {
            pts: self.pts,
            data,
            silence,
        };
        self.pts += self.frame_samples as u64;
        frame
    }
}

impl Drop for TrackReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
