//! Host-facing call surface.
//!
//! One [`PipelineHandle`] per embedding host, owning both pipelines: the
//! detection worker and the recording session. The handle validates
//! arguments at the boundary and keeps every per-frame failure fail-soft, so
//! the host's frame loop never has to care about a single bad frame. The
//! caller owns serialization: methods take `&mut self` and must not be
//! invoked concurrently.

pub use telemetry::init_tracing;

mod telemetry;

use std::path::PathBuf;

use detect_core::{DecoderConfig, DetectionWorker, DetectorBackend, FrameBuffer, Plane};
use record_core::{EncoderSettings, RecordingSession};
use thiserror::Error;
use tracing::{debug, warn};

pub use detect_core::Detection;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub struct PipelineHandle {
    worker: Option<DetectionWorker>,
    recorder: RecordingSession,
    decoder_config: DecoderConfig,
}

impl PipelineHandle {
    /// Handle with production recording wiring; `output_dir` is the
    /// transient location recordings are written to.
    pub fn new(output_dir: PathBuf) -> Self {
        Self::with_session(RecordingSession::new(output_dir))
    }

    /// Handle over a preassembled session (tests inject encoder and sink
    /// doubles this way).
    pub fn with_session(recorder: RecordingSession) -> Self {
        Self {
            worker: None,
            recorder,
            decoder_config: DecoderConfig::default(),
        }
    }

    /// Override the detection thresholds before `initialize`.
    pub fn with_decoder_config(mut self, config: DecoderConfig) -> Self {
        self.decoder_config = config;
        self
    }

    /// Load the inference backend and spawn the detection worker. Returns
    /// `false` when the backend cannot be built; the handle stays usable and
    /// detection simply reports nothing until a later attempt succeeds.
    pub fn initialize<F>(&mut self, load_backend: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<Box<dyn DetectorBackend>>,
    {
        let backend = match load_backend() {
            Ok(backend) => backend,
            Err(err) => {
                warn!("detector initialization failed: {err:#}");
                return false;
            }
        };
        match DetectionWorker::spawn(backend, self.decoder_config) {
            Ok(worker) => {
                self.worker = Some(worker);
                debug!("detector initialized");
                true
            }
            Err(err) => {
                warn!("failed to start detection worker: {err:#}");
                false
            }
        }
    }

    /// Run detection on one camera frame and return the final detections in
    /// normalized top-left-origin coordinates. An uninitialized detector
    /// yields an empty list; malformed arguments are rejected before
    /// touching the core.
    pub fn detect_barbell(
        &self,
        width: usize,
        height: usize,
        planes: &[Plane<'_>],
    ) -> Result<Vec<Detection>, BridgeError> {
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "frame geometry {width}x{height}"
            )));
        }
        if planes.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "frame carries no pixel planes".into(),
            ));
        }

        let Some(worker) = self.worker.as_ref() else {
            return Ok(Vec::new());
        };

        let frame = FrameBuffer {
            width,
            height,
            planes: planes.to_vec(),
        };
        Ok(worker.submit(&frame).wait())
    }

    /// Drop the detection worker. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.worker.take().is_some() {
            debug!("detector disposed");
        }
    }

    /// Begin a recording session. Returns `false` on malformed arguments or
    /// when the encoder/muxer cannot be allocated; the session stays idle.
    pub fn start_recording(&mut self, width: u32, height: u32, fps: u32, bitrate: u32) -> bool {
        if width == 0 || height == 0 || fps == 0 || bitrate == 0 {
            warn!(
                width,
                height, fps, bitrate, "rejecting recording with invalid parameters"
            );
            return false;
        }
        match self
            .recorder
            .start(EncoderSettings::new(width, height, fps, bitrate))
        {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to start recording: {err:#}");
                false
            }
        }
    }

    /// Feed one BGRA camera frame, optionally compositing a PNG overlay on
    /// top. A no-op while idle; every per-frame failure is silent.
    pub fn add_frame(
        &mut self,
        camera_frame: &[u8],
        width: u32,
        height: u32,
        overlay_png: Option<&[u8]>,
    ) {
        self.recorder
            .add_frame(camera_frame, overlay_png, width, height);
    }

    /// Finish the current recording and return the container path, or `None`
    /// when idle or when finishing failed.
    pub fn stop_recording(&mut self) -> Option<PathBuf> {
        self.recorder.stop()
    }
}
