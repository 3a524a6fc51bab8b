//! Recording pipeline: overlay compositing, stateful H.264 encoding and
//! incremental MPEG-4 muxing.
//!
//! The module split mirrors the lifecycle:
//! - `encoder`: the dequeue/queue/drain seam and its data types.
//! - `h264`: Annex B stream splitting, access-unit grouping, AVCC packing.
//! - `ffmpeg`: the child-process encoder implementation.
//! - `muxer`: the container sink seam and the MPEG-4 file writer.
//! - `compositor`: in-place overlay blending.
//! - `session`: the Idle → Recording → Idle state machine tying it together.
//! - `error`: typed failures crossing the crate boundary.

pub use compositor::composite_overlay;
pub use encoder::{
    EncodedSample, EncoderPoll, EncoderSettings, InputBuffer, VideoEncoder, VideoFormat,
};
pub use error::RecordError;
pub use ffmpeg::FfmpegEncoder;
pub use muxer::{Mp4FileSink, SampleSink};
pub use session::{EncoderFactory, RecordingSession, SinkFactory};

mod compositor;
mod encoder;
mod error;
mod ffmpeg;
mod h264;
mod muxer;
mod session;
