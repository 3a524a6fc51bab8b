//! Dedicated inference worker.
//!
//! One named thread owns the backend; a bounded job channel serializes
//! submissions so at most a single inference is in flight per detector.
//! Results are delivered asynchronously through a receipt, and every failure
//! path degrades to an empty detection list.

use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::backend::{BackendOutput, DetectorBackend};
use crate::decode::{decode, DecoderConfig, Detection};
use crate::frame::{FrameBuffer, OwnedFrame};
use crate::preprocess::preprocess;

/// Pending result of one detection call. The worker sends exactly one value
/// per job; a worker that died mid-job resolves to an empty list.
pub struct DetectionReceipt {
    rx: Receiver<Vec<Detection>>,
}

impl DetectionReceipt {
    pub fn wait(self) -> Vec<Detection> {
        self.rx.recv().unwrap_or_default()
    }

    fn resolved_empty() -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Vec::new());
        Self { rx }
    }
}

struct DetectionJob {
    frame: OwnedFrame,
    reply: Sender<Vec<Detection>>,
}

/// Handle to the worker thread. Dropping it closes the job channel and joins
/// the thread.
pub struct DetectionWorker {
    jobs: Option<Sender<DetectionJob>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DetectionWorker {
    pub fn spawn(backend: Box<dyn DetectorBackend>, config: DecoderConfig) -> Result<Self> {
        let (jobs_tx, jobs_rx) = bounded::<DetectionJob>(1);
        let handle = thread::Builder::new()
            .name("detector-worker".into())
            .spawn(move || worker_loop(backend, config, jobs_rx))
            .context("failed to spawn detection worker thread")?;

        Ok(Self {
            jobs: Some(jobs_tx),
            handle: Some(handle),
        })
    }

    /// Copy the frame and queue it for inference. Blocks only while a
    /// previous job is still queued, keeping one inference in flight.
    pub fn submit(&self, frame: &FrameBuffer<'_>) -> DetectionReceipt {
        let Some(jobs) = self.jobs.as_ref() else {
            return DetectionReceipt::resolved_empty();
        };

        let (reply_tx, reply_rx) = bounded(1);
        let job = DetectionJob {
            frame: OwnedFrame::copy_of(frame),
            reply: reply_tx,
        };
        if jobs.send(job).is_err() {
            warn!("detection worker is gone; returning empty result");
            return DetectionReceipt::resolved_empty();
        }

        DetectionReceipt { rx: reply_rx }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    mut backend: Box<dyn DetectorBackend>,
    config: DecoderConfig,
    jobs: Receiver<DetectionJob>,
) {
    for job in jobs {
        let started = Instant::now();
        let detections = match run_detection(backend.as_mut(), &config, &job.frame) {
            Ok(detections) => detections,
            Err(err) => {
                error!("detection failed: {err:#}");
                metrics::counter!("detector_failures_total").increment(1);
                Vec::new()
            }
        };
        metrics::histogram!("detector_inference_seconds")
            .record(started.elapsed().as_secs_f64());

        // The receipt may have been dropped by the caller; that is fine.
        let _ = job.reply.send(detections);
    }
    debug!("detection worker stopped");
}

fn run_detection(
    backend: &mut dyn DetectorBackend,
    config: &DecoderConfig,
    frame: &OwnedFrame,
) -> Result<Vec<Detection>> {
    let view = frame.view();
    let tensor = preprocess(&view, config.input_size).context("frame preprocessing failed")?;
    match backend.infer(&tensor).context("backend inference failed")? {
        BackendOutput::Grid(grid) => Ok(decode(&grid, config)),
        BackendOutput::Ranked(detections) => Ok(detections),
    }
}
