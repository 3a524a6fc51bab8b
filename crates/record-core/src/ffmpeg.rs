//! ffmpeg-backed H.264 encoder.
//!
//! Spawns an `ffmpeg` child that consumes raw BGRA frames on stdin and emits
//! an Annex B stream on stdout. A feed thread writes queued input slots and
//! recycles them into the free pool; a drain thread splits stdout into
//! access units, pairs each with the timestamp queued at submit time, and
//! forwards encoder events over a channel. The encoder runs zero-latency so
//! output order matches input order.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::encoder::{
    EncodedSample, EncoderPoll, EncoderSettings, InputBuffer, VideoEncoder, VideoFormat,
};
use crate::error::RecordError;
use crate::h264::{AccessUnit, AccessUnitAssembler, AnnexBSplitter};

/// Input slots in flight; the valve that makes `dequeue_input` time out when
/// the child cannot keep up.
const INPUT_POOL_SIZE: usize = 4;
const READ_CHUNK_BYTES: usize = 64 * 1024;

enum FeedCommand {
    Frame(InputBuffer, i64),
    Finish,
}

pub struct FfmpegEncoder {
    feed_tx: Option<Sender<FeedCommand>>,
    free_rx: Receiver<InputBuffer>,
    events_rx: Receiver<EncoderPoll>,
    feed_handle: Option<thread::JoinHandle<()>>,
    drain_handle: Option<thread::JoinHandle<()>>,
}

impl FfmpegEncoder {
    pub fn spawn(settings: &EncoderSettings) -> Result<Self, RecordError> {
        if settings.width == 0 || settings.height == 0 || settings.fps == 0 {
            return Err(RecordError::InvalidSettings {
                width: settings.width,
                height: settings.height,
                fps: settings.fps,
            });
        }

        let keyint = settings.keyframe_interval_frames.max(1);
        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("bgra")
            .arg("-s")
            .arg(format!("{}x{}", settings.width, settings.height))
            .arg("-r")
            .arg(settings.fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("veryfast")
            .arg("-tune")
            .arg("zerolatency")
            .arg("-x264-params")
            .arg(format!(
                "aud=1:keyint={keyint}:min-keyint={keyint}:scenecut=0"
            ))
            .arg("-b:v")
            .arg(settings.bitrate_bps.to_string())
            .arg("-f")
            .arg("h264")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(RecordError::SpawnEncoder)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;

        debug!(
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            bitrate = settings.bitrate_bps,
            "ffmpeg encoder started"
        );

        let (free_tx, free_rx) = bounded::<InputBuffer>(INPUT_POOL_SIZE);
        for _ in 0..INPUT_POOL_SIZE {
            let _ = free_tx.send(InputBuffer::zeroed(settings.frame_bytes()));
        }

        let (feed_tx, feed_rx) = unbounded::<FeedCommand>();
        let (events_tx, events_rx) = unbounded::<EncoderPoll>();
        let pts_queue = Arc::new(Mutex::new(VecDeque::<i64>::new()));

        let feed_pts = pts_queue.clone();
        let feed_handle = thread::Builder::new()
            .name("encoder-feed".into())
            .spawn(move || feed_loop(stdin, feed_rx, free_tx, feed_pts))
            .context("failed to spawn encoder feed thread")?;

        let drain_settings = *settings;
        let drain_handle = thread::Builder::new()
            .name("encoder-drain".into())
            .spawn(move || drain_loop(stdout, child, events_tx, pts_queue, drain_settings))
            .context("failed to spawn encoder drain thread")?;

        Ok(Self {
            feed_tx: Some(feed_tx),
            free_rx,
            events_rx,
            feed_handle: Some(feed_handle),
            drain_handle: Some(drain_handle),
        })
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputBuffer>, RecordError> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(buffer) => Ok(Some(buffer)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("encoder slot pool closed; dropping frame");
                Ok(None)
            }
        }
    }

    fn queue_input(&mut self, buffer: InputBuffer, pts_us: i64) -> Result<(), RecordError> {
        let Some(feed_tx) = self.feed_tx.as_ref() else {
            return Err(RecordError::Lifecycle(
                "input queued after end of stream was signalled",
            ));
        };
        feed_tx
            .send(FeedCommand::Frame(buffer, pts_us))
            .map_err(|_| anyhow!("encoder feed thread stopped"))?;
        Ok(())
    }

    fn poll_output(&mut self, timeout: Duration) -> Result<EncoderPoll, RecordError> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Ok(EncoderPoll::TimedOut),
            // The drain thread sends EndOfStream before exiting, so a closed
            // channel only ever means the stream is over.
            Err(RecvTimeoutError::Disconnected) => Ok(EncoderPoll::EndOfStream),
        }
    }

    fn signal_end_of_input(&mut self) -> Result<(), RecordError> {
        if let Some(feed_tx) = self.feed_tx.take() {
            let _ = feed_tx.send(FeedCommand::Finish);
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Closing the feed channel closes the child's stdin, which makes
        // ffmpeg flush and exit; both threads then run out on their own.
        self.feed_tx.take();
        if let Some(handle) = self.feed_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.drain_handle.take() {
            let _ = handle.join();
        }
    }
}

fn feed_loop(
    mut stdin: ChildStdin,
    feed_rx: Receiver<FeedCommand>,
    free_tx: Sender<InputBuffer>,
    pts_queue: Arc<Mutex<VecDeque<i64>>>,
) {
    for command in feed_rx {
        match command {
            FeedCommand::Frame(buffer, pts_us) => {
                if let Ok(mut queue) = pts_queue.lock() {
                    queue.push_back(pts_us);
                }
                if let Err(err) = stdin.write_all(buffer.pixels()) {
                    warn!("encoder input pipe closed early: {err}");
                    break;
                }
                // Recycle the slot; the receiver may already be gone.
                let _ = free_tx.send(buffer);
            }
            FeedCommand::Finish => break,
        }
    }
    // Dropping stdin signals end-of-input to the child.
}

fn drain_loop(
    mut stdout: ChildStdout,
    mut child: Child,
    events_tx: Sender<EncoderPoll>,
    pts_queue: Arc<Mutex<VecDeque<i64>>>,
    settings: EncoderSettings,
) {
    let mut splitter = AnnexBSplitter::new();
    let mut assembler = AccessUnitAssembler::new();
    let mut format_sent = false;
    let mut last_pts = -(settings.frame_duration_us() as i64);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut aborted = false;

    'read: loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for nal in splitter.push(&chunk[..n]) {
                    if let Some(unit) = assembler.push(nal) {
                        if !emit_unit(
                            &events_tx,
                            &assembler,
                            unit,
                            &pts_queue,
                            &settings,
                            &mut format_sent,
                            &mut last_pts,
                        ) {
                            // The session stopped listening; stop reading
                            // and tear the child down below.
                            aborted = true;
                            break 'read;
                        }
                    }
                }
            }
            Err(err) => {
                error!("encoder output read failed: {err}");
                aborted = true;
                break;
            }
        }
    }

    if let Some(nal) = splitter.flush() {
        if let Some(unit) = assembler.push(nal) {
            let _ = emit_unit(
                &events_tx,
                &assembler,
                unit,
                &pts_queue,
                &settings,
                &mut format_sent,
                &mut last_pts,
            );
        }
    }
    if let Some(unit) = assembler.finish() {
        let _ = emit_unit(
            &events_tx,
            &assembler,
            unit,
            &pts_queue,
            &settings,
            &mut format_sent,
            &mut last_pts,
        );
    }

    let _ = events_tx.send(EncoderPoll::EndOfStream);

    // Close our end of the pipe before reaping; a child blocked on a write
    // must not be waited on while the pipe would never drain.
    drop(stdout);
    if aborted {
        let _ = child.kill();
    }
    match child.wait() {
        Ok(status) if !status.success() => {
            warn!("ffmpeg encoder exited with {status}");
        }
        Ok(_) => debug!("ffmpeg encoder finished"),
        Err(err) => warn!("failed to reap ffmpeg encoder: {err}"),
    }
}

/// Forward one access unit, announcing the stream format first. Returns
/// false once the session has stopped listening.
fn emit_unit(
    events_tx: &Sender<EncoderPoll>,
    assembler: &AccessUnitAssembler,
    unit: AccessUnit,
    pts_queue: &Arc<Mutex<VecDeque<i64>>>,
    settings: &EncoderSettings,
    format_sent: &mut bool,
    last_pts: &mut i64,
) -> bool {
    if !*format_sent {
        if let Some((sps, pps)) = assembler.parameter_sets() {
            let format = VideoFormat {
                width: settings.width,
                height: settings.height,
                sps: sps.to_vec(),
                pps: pps.to_vec(),
            };
            if events_tx.send(EncoderPoll::FormatChanged(format)).is_err() {
                return false;
            }
            *format_sent = true;
        }
    }

    let queued = pts_queue.lock().ok().and_then(|mut queue| queue.pop_front());
    let pts_us = queued.unwrap_or(*last_pts + settings.frame_duration_us() as i64);
    *last_pts = pts_us;

    let sample = EncodedSample {
        data: unit.to_annex_b(),
        pts_us,
        keyframe: unit.keyframe(),
    };
    events_tx.send(EncoderPoll::Sample(sample)).is_ok()
}
