//! Recording session state machine.
//!
//! Owns the encoder and container sink for one recording and sequences the
//! start → feed → drain → finalize lifecycle. The session is driven serially
//! by a single owning context; it performs no internal locking.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::compositor::composite_overlay;
use crate::encoder::{EncoderPoll, EncoderSettings, VideoEncoder};
use crate::error::RecordError;
use crate::ffmpeg::FfmpegEncoder;
use crate::muxer::{Mp4FileSink, SampleSink};

/// Bounded wait for an encoder input slot; the backpressure valve.
const INPUT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);
/// Per-poll wait while draining encoder output.
const DRAIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// Upper bound on the final blocking drain so a wedged encoder cannot hang
/// the owning thread.
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

pub type EncoderFactory =
    Box<dyn Fn(&EncoderSettings) -> Result<Box<dyn VideoEncoder>, RecordError> + Send>;
pub type SinkFactory =
    Box<dyn Fn(&Path, &EncoderSettings) -> Result<Box<dyn SampleSink>, RecordError> + Send>;

/// Session states. Encoder, sink and counters exist only while recording, so
/// no sample can be written through a half-torn-down session.
enum State {
    Idle,
    Recording(Active),
}

struct Active {
    encoder: Box<dyn VideoEncoder>,
    sink: Box<dyn SampleSink>,
    sink_started: bool,
    frame_count: u64,
    settings: EncoderSettings,
}

pub struct RecordingSession {
    output_dir: PathBuf,
    encoder_factory: EncoderFactory,
    sink_factory: SinkFactory,
    state: State,
}

impl RecordingSession {
    /// Session with the production wiring: ffmpeg encoder, MPEG-4 sink.
    pub fn new(output_dir: PathBuf) -> Self {
        Self::with_factories(
            output_dir,
            Box::new(|settings| {
                Ok(Box::new(FfmpegEncoder::spawn(settings)?) as Box<dyn VideoEncoder>)
            }),
            Box::new(|path, settings| {
                Ok(Box::new(Mp4FileSink::create(path, settings.fps)?) as Box<dyn SampleSink>)
            }),
        )
    }

    pub fn with_factories(
        output_dir: PathBuf,
        encoder_factory: EncoderFactory,
        sink_factory: SinkFactory,
    ) -> Self {
        Self {
            output_dir,
            encoder_factory,
            sink_factory,
            state: State::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording(_))
    }

    /// Frames accepted by the current recording; 0 while idle.
    pub fn frame_count(&self) -> u64 {
        match &self.state {
            State::Recording(active) => active.frame_count,
            State::Idle => 0,
        }
    }

    /// Allocate encoder and sink and enter the recording state. On any
    /// allocation failure the session stays idle and everything built so
    /// far is released.
    pub fn start(&mut self, settings: EncoderSettings) -> Result<(), RecordError> {
        if self.is_recording() {
            return Err(RecordError::Lifecycle("a recording is already in progress"));
        }

        let output_path = self
            .output_dir
            .join(format!("recording_{}.mp4", Utc::now().timestamp_millis()));
        let encoder = (self.encoder_factory)(&settings)?;
        let sink = (self.sink_factory)(&output_path, &settings)?;

        debug!(
            path = %output_path.display(),
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            "recording started"
        );
        self.state = State::Recording(Active {
            encoder,
            sink,
            sink_started: false,
            frame_count: 0,
            settings,
        });
        Ok(())
    }

    /// Feed one camera frame, optionally compositing an overlay on top.
    ///
    /// Ignored while idle. A frame that cannot get an input slot within the
    /// bounded wait is dropped; per-frame failures never end the session,
    /// since the next frame supersedes a lost one.
    pub fn add_frame(
        &mut self,
        camera_frame: &[u8],
        overlay_png: Option<&[u8]>,
        width: u32,
        height: u32,
    ) {
        let State::Recording(active) = &mut self.state else {
            debug!("ignoring frame while idle");
            return;
        };

        if let Err(err) = active.accept_frame(camera_frame, overlay_png, width, height) {
            warn!("dropping frame: {err:#}");
            metrics::counter!("recording_frame_errors_total").increment(1);
        }
        if let Err(err) = active.drain(false) {
            warn!("encoder drain failed: {err:#}");
            metrics::counter!("recording_drain_errors_total").increment(1);
        }
    }

    /// Finish the recording and return the container path. A no-op while
    /// idle, so calling it twice is safe. Failures release all resources and
    /// return `None`; the session is idle again either way.
    pub fn stop(&mut self) -> Option<PathBuf> {
        let State::Recording(active) = std::mem::replace(&mut self.state, State::Idle) else {
            return None;
        };

        match finish(active) {
            Ok(path) => Some(path),
            Err(err) => {
                error!("recording stop failed: {err:#}");
                None
            }
        }
    }
}

fn finish(mut active: Active) -> Result<PathBuf> {
    active
        .encoder
        .signal_end_of_input()
        .context("failed to signal end of input")?;
    active.drain(true).context("final drain failed")?;

    let Active {
        encoder,
        sink,
        frame_count,
        ..
    } = active;
    // The encoder goes first; the sink must outlive the last drained sample.
    drop(encoder);

    let path = sink.finalize().context("failed to finalize container")?;
    debug!(frames = frame_count, path = %path.display(), "recording finished");
    Ok(path)
}

impl Active {
    fn accept_frame(
        &mut self,
        camera_frame: &[u8],
        overlay_png: Option<&[u8]>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let Some(mut buffer) = self.encoder.dequeue_input(INPUT_DEQUEUE_TIMEOUT)? else {
            metrics::counter!("recording_dropped_frames_total").increment(1);
            debug!(
                frame = self.frame_count,
                "no encoder slot available; dropping frame"
            );
            return Ok(());
        };

        buffer.fill_clamped(camera_frame);
        if let Some(png) = overlay_png {
            composite_overlay(buffer.pixels_mut(), png, width, height);
        }

        let pts_us =
            self.frame_count as i64 * 1_000_000 / i64::from(self.settings.fps.max(1));
        self.encoder.queue_input(buffer, pts_us)?;
        self.frame_count += 1;
        Ok(())
    }

    /// Move whatever the encoder has ready into the sink. The first format
    /// event creates and starts the container track; samples are written
    /// only after that, each with its own timestamp. Every polled sample is
    /// released (dropped) whether it was written or not.
    fn drain(&mut self, blocking: bool) -> Result<()> {
        let deadline = Instant::now() + STOP_DRAIN_DEADLINE;
        loop {
            match self.encoder.poll_output(DRAIN_POLL_TIMEOUT)? {
                EncoderPoll::FormatChanged(format) => {
                    if self.sink_started {
                        warn!("encoder format changed mid-stream; ignoring");
                        continue;
                    }
                    self.sink.add_track(&format)?;
                    self.sink.start()?;
                    self.sink_started = true;
                    debug!(
                        width = format.width,
                        height = format.height,
                        "container track started"
                    );
                }
                EncoderPoll::Sample(sample) => {
                    if self.sink_started && !sample.data.is_empty() {
                        self.sink.write_sample(&sample)?;
                        metrics::counter!("recording_samples_written_total").increment(1);
                    }
                }
                EncoderPoll::TimedOut => {
                    if !blocking {
                        break;
                    }
                    if Instant::now() >= deadline {
                        bail!("timed out waiting for encoder end-of-stream");
                    }
                }
                EncoderPoll::EndOfStream => break,
            }
        }
        Ok(())
    }
}
