//! End-to-end exercises of the host-facing surface, with the inference
//! backend and the encoder/sink pair replaced by test doubles.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bridge::{BridgeError, PipelineHandle};
use bytes::Bytes;
use detect_core::{BackendOutput, DetectorBackend, GridOutput, Plane, Tensor};
use record_core::{
    EncodedSample, EncoderPoll, EncoderSettings, InputBuffer, RecordError, RecordingSession,
    SampleSink, VideoEncoder, VideoFormat,
};

// ---------------------------------------------------------------------------
// Detection doubles
// ---------------------------------------------------------------------------

/// Backend that always reports one strong box centered in the frame.
struct OneBoxBackend;

impl DetectorBackend for OneBoxBackend {
    fn infer(&mut self, _input: &Tensor) -> Result<BackendOutput> {
        let values = vec![320.0, 320.0, 64.0, 64.0, 0.9];
        Ok(BackendOutput::Grid(GridOutput::new(5, 1, values)?))
    }
}

fn bgra_plane(data: &[u8]) -> Vec<Plane<'_>> {
    vec![Plane::new(data)]
}

#[test]
fn detection_round_trip_through_the_handle() {
    let mut handle = PipelineHandle::new(std::env::temp_dir());
    assert!(handle.initialize(|| Ok(Box::new(OneBoxBackend))));

    let data = vec![128u8; 8 * 8 * 4];
    let detections = handle.detect_barbell(8, 8, &bgra_plane(&data)).unwrap();

    assert_eq!(detections.len(), 1);
    let det = detections[0];
    assert!((det.x - 0.5).abs() < 1e-6);
    assert!((det.y - 0.5).abs() < 1e-6);
    assert!((det.width - 0.1).abs() < 1e-6);
    assert!((det.confidence - 0.9).abs() < 1e-6);
}

#[test]
fn uninitialized_detector_reports_nothing() {
    let handle = PipelineHandle::new(std::env::temp_dir());
    let data = vec![0u8; 4 * 4 * 4];
    assert!(handle
        .detect_barbell(4, 4, &bgra_plane(&data))
        .unwrap()
        .is_empty());
}

#[test]
fn failed_backend_load_reports_false() {
    let mut handle = PipelineHandle::new(std::env::temp_dir());
    assert!(!handle.initialize(|| bail!("model file is corrupt")));

    let data = vec![0u8; 4 * 4 * 4];
    assert!(handle
        .detect_barbell(4, 4, &bgra_plane(&data))
        .unwrap()
        .is_empty());
}

#[test]
fn malformed_arguments_are_rejected_at_the_boundary() {
    let mut handle = PipelineHandle::new(std::env::temp_dir());
    handle.initialize(|| Ok(Box::new(OneBoxBackend)));

    let data = vec![0u8; 16];
    assert!(matches!(
        handle.detect_barbell(0, 4, &bgra_plane(&data)),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        handle.detect_barbell(4, 4, &[]),
        Err(BridgeError::InvalidArgument(_))
    ));
}

#[test]
fn dispose_is_idempotent_and_silences_detection() {
    let mut handle = PipelineHandle::new(std::env::temp_dir());
    handle.initialize(|| Ok(Box::new(OneBoxBackend)));
    handle.dispose();
    handle.dispose();

    let data = vec![128u8; 4 * 4 * 4];
    assert!(handle
        .detect_barbell(4, 4, &bgra_plane(&data))
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------------
// Recording doubles
// ---------------------------------------------------------------------------

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E];
const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

struct StubEncoder {
    free: VecDeque<InputBuffer>,
    pending: VecDeque<EncoderPoll>,
    settings: EncoderSettings,
    format_sent: bool,
    finished: bool,
}

impl StubEncoder {
    fn new(settings: EncoderSettings) -> Self {
        let mut free = VecDeque::new();
        for _ in 0..4 {
            free.push_back(InputBuffer::zeroed(settings.frame_bytes()));
        }
        Self {
            free,
            pending: VecDeque::new(),
            settings,
            format_sent: false,
            finished: false,
        }
    }
}

impl VideoEncoder for StubEncoder {
    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputBuffer>, RecordError> {
        Ok(self.free.pop_front())
    }

    fn queue_input(&mut self, buffer: InputBuffer, pts_us: i64) -> Result<(), RecordError> {
        if !self.format_sent {
            self.pending
                .push_back(EncoderPoll::FormatChanged(VideoFormat {
                    width: self.settings.width,
                    height: self.settings.height,
                    sps: SPS.to_vec(),
                    pps: PPS.to_vec(),
                }));
            self.format_sent = true;
        }
        self.pending.push_back(EncoderPoll::Sample(EncodedSample {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x84]),
            pts_us,
            keyframe: true,
        }));
        self.free.push_back(buffer);
        Ok(())
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<EncoderPoll, RecordError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        if self.finished {
            Ok(EncoderPoll::EndOfStream)
        } else {
            Ok(EncoderPoll::TimedOut)
        }
    }

    fn signal_end_of_input(&mut self) -> Result<(), RecordError> {
        self.finished = true;
        Ok(())
    }
}

#[derive(Default)]
struct SinkLog {
    pts: Vec<i64>,
    finalized: bool,
}

struct StubSink {
    path: PathBuf,
    log: Arc<Mutex<SinkLog>>,
}

impl SampleSink for StubSink {
    fn add_track(&mut self, _format: &VideoFormat) -> Result<(), RecordError> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), RecordError> {
        Ok(())
    }
    fn write_sample(&mut self, sample: &EncodedSample) -> Result<(), RecordError> {
        self.log.lock().unwrap().pts.push(sample.pts_us);
        Ok(())
    }
    fn finalize(self: Box<Self>) -> Result<PathBuf, RecordError> {
        self.log.lock().unwrap().finalized = true;
        Ok(self.path)
    }
}

fn recording_handle(output_dir: PathBuf) -> (PipelineHandle, Arc<Mutex<SinkLog>>) {
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let sink_log = log.clone();
    let session = RecordingSession::with_factories(
        output_dir,
        Box::new(|settings| Ok(Box::new(StubEncoder::new(*settings)) as Box<dyn VideoEncoder>)),
        Box::new(move |path, _settings| {
            Ok(Box::new(StubSink {
                path: path.to_path_buf(),
                log: sink_log.clone(),
            }) as Box<dyn SampleSink>)
        }),
    );
    (PipelineHandle::with_session(session), log)
}

#[test]
fn recording_lifecycle_through_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    let (mut handle, log) = recording_handle(dir.path().to_path_buf());

    // Frames before start are ignored.
    let frame = vec![200u8; 4 * 4 * 4];
    handle.add_frame(&frame, 4, 4, None);
    assert!(log.lock().unwrap().pts.is_empty());

    assert!(handle.start_recording(4, 4, 30, 500_000));
    for _ in 0..3 {
        handle.add_frame(&frame, 4, 4, None);
    }

    let path = handle.stop_recording().expect("recording should finish");
    assert!(path.starts_with(dir.path()));

    let log = log.lock().unwrap();
    assert_eq!(log.pts, vec![0, 33_333, 66_666]);
    assert!(log.finalized);

    // Second stop is the idle no-op.
    drop(log);
    assert!(handle.stop_recording().is_none());
}

#[test]
fn invalid_recording_parameters_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut handle, _log) = recording_handle(dir.path().to_path_buf());

    assert!(!handle.start_recording(0, 720, 30, 500_000));
    assert!(!handle.start_recording(1280, 720, 0, 500_000));
    assert!(handle.stop_recording().is_none());
}

#[test]
fn both_pipelines_run_on_the_same_handle() {
    let dir = tempfile::tempdir().unwrap();
    let (mut handle, log) = recording_handle(dir.path().to_path_buf());
    assert!(handle.initialize(|| Ok(Box::new(OneBoxBackend))));

    assert!(handle.start_recording(8, 8, 30, 500_000));
    let frame = vec![128u8; 8 * 8 * 4];
    for _ in 0..2 {
        // The same frame goes to detection and into the recording.
        let detections = handle.detect_barbell(8, 8, &bgra_plane(&frame)).unwrap();
        assert_eq!(detections.len(), 1);
        handle.add_frame(&frame, 8, 8, None);
    }
    assert!(handle.stop_recording().is_some());
    assert_eq!(log.lock().unwrap().pts.len(), 2);
}
