//! Typed errors for the recording resource boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors crossing the crate boundary while acquiring, driving or finalizing
/// the encoder/muxer pair. Per-frame problems never surface here; the
/// session handles those fail-soft.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Geometry or rate parameters no encoder can be configured with.
    #[error("cannot encode {width}x{height} at {fps} fps")]
    InvalidSettings { width: u32, height: u32, fps: u32 },
    /// The encoder process could not be started.
    #[error("failed to spawn ffmpeg encoder. Is it installed?")]
    SpawnEncoder(#[source] io::Error),
    /// The container file could not be created.
    #[error("failed to create container file {path:?}")]
    CreateContainer {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Encoder or sink driven outside its start → feed → finalize order.
    #[error("recording lifecycle violation: {0}")]
    Lifecycle(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
