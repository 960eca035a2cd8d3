//! Frame delivery out of the engine.
//!
//! CPU-path streams hand every prepared frame to a [`FrameSink`] from inside
//! the stream callback. The bundled [`ChannelSink`] copies frames onto a
//! bounded channel so a consumer thread can take its time without stalling
//! the loop.

use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{trace, warn};

use crate::video::{OwnedVideoFrame, VideoFrame};

/// Receives frames from a camera stream. `None` marks the end of the feed;
/// whatever was showing should be cleared.
pub trait FrameSink: Send {
    fn output_video(&mut self, frame: Option<&VideoFrame<'_>>);
}

/// A sink that copies frames onto a bounded crossbeam channel.
///
/// The stream loop must never block on a slow consumer, so a full channel
/// drops the frame instead of waiting.
pub struct ChannelSink {
    tx: Sender<Option<OwnedVideoFrame>>,
    started: Instant,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<Option<OwnedVideoFrame>>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                started: Instant::now(),
                dropped: 0,
            },
            rx,
        )
    }

    /// Frames discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl FrameSink for ChannelSink {
    fn output_video(&mut self, frame: Option<&VideoFrame<'_>>) {
        let timestamp_ns = self.started.elapsed().as_nanos() as i64;
        let message = frame.map(|f| f.to_owned_frame(timestamp_ns));
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                trace!(dropped = self.dropped, "Frame channel full, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Frame consumer went away");
            }
        }
    }
}
