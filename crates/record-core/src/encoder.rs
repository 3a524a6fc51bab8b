//! Encoder seam between the recording session and concrete encoders.
//!
//! The lifecycle mirrors a hardware codec: dequeue an input slot, fill it,
//! queue it with a timestamp, then drain output events until none are ready.
//! Input slots are the backpressure valve: when none frees up within the
//! bounded wait, the caller drops the frame.

use std::time::Duration;

use bytes::Bytes;

use crate::error::RecordError;

/// Geometry, rate and cadence a session asks its encoder for.
#[derive(Clone, Copy, Debug)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
    /// Keyframe cadence in frames; one second of frames by construction.
    pub keyframe_interval_frames: u32,
}

impl EncoderSettings {
    pub fn new(width: u32, height: u32, fps: u32, bitrate_bps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate_bps,
            keyframe_interval_frames: fps.max(1),
        }
    }

    /// Size of one interleaved B,G,R,A frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn frame_duration_us(&self) -> u64 {
        1_000_000 / u64::from(self.fps.max(1))
    }
}

/// Fixed-capacity pixel buffer owned by the encoder's slot pool. Returned to
/// the pool by the encoder once the frame has been consumed.
pub struct InputBuffer {
    data: Vec<u8>,
}

impl InputBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copy as much of `src` as fits, leaving any remainder of the slot
    /// untouched. Returns the number of bytes copied.
    pub fn fill_clamped(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.data.len());
        self.data[..len].copy_from_slice(&src[..len]);
        len
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Stream parameters announced once by the encoder before any sample.
#[derive(Clone, Debug)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// One compressed access unit (Annex B) with its presentation timestamp.
#[derive(Clone, Debug)]
pub struct EncodedSample {
    pub data: Bytes,
    pub pts_us: i64,
    pub keyframe: bool,
}

/// Result of one output poll. Polled samples are owned by the caller and
/// released by dropping them, written to the container or not.
pub enum EncoderPoll {
    /// Emitted exactly once, before the first sample.
    FormatChanged(VideoFormat),
    Sample(EncodedSample),
    /// Nothing became available within the poll timeout.
    TimedOut,
    /// All pending output has been drained after end-of-input.
    EndOfStream,
}

/// A running video encoder instance, owned by a single recording session.
pub trait VideoEncoder: Send {
    /// Wait up to `timeout` for a free input slot; `None` means the frame
    /// should be dropped.
    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputBuffer>, RecordError>;

    /// Submit a filled slot with its presentation timestamp in microseconds.
    fn queue_input(&mut self, buffer: InputBuffer, pts_us: i64) -> Result<(), RecordError>;

    /// Wait up to `timeout` for the next output event.
    fn poll_output(&mut self, timeout: Duration) -> Result<EncoderPoll, RecordError>;

    /// No further input will be queued; the encoder flushes and eventually
    /// reports [`EncoderPoll::EndOfStream`].
    fn signal_end_of_input(&mut self) -> Result<(), RecordError>;
}
