//! Container sink seam and the MPEG-4 implementation.
//!
//! The sink mirrors the muxer half of the recording lifecycle: a single
//! video track is added exactly once (from the encoder's format event),
//! writing starts explicitly, and `finalize` closes the container and hands
//! back the output path.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use mp4::{
    AvcConfig, FourCC, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType,
};
use tracing::debug;

use crate::encoder::{EncodedSample, VideoFormat};
use crate::error::RecordError;
use crate::h264::annex_b_to_avcc;

/// Receives the compressed stream. Samples may only be written after a track
/// has been added and writing started, and the track is added exactly once.
pub trait SampleSink: Send {
    fn add_track(&mut self, format: &VideoFormat) -> Result<(), RecordError>;
    fn start(&mut self) -> Result<(), RecordError>;
    fn write_sample(&mut self, sample: &EncodedSample) -> Result<(), RecordError>;
    fn finalize(self: Box<Self>) -> Result<PathBuf, RecordError>;
}

/// Track timescale in units per second; pts microseconds map 1:1.
const TRACK_TIMESCALE: u32 = 1_000_000;
/// Movie-level timescale, per the container default.
const MOVIE_TIMESCALE: u32 = 1_000;

/// MPEG-4 file writer backed by the `mp4` crate.
pub struct Mp4FileSink {
    path: PathBuf,
    fps: u32,
    writer: Mp4Writer<BufWriter<File>>,
    track_added: bool,
    started: bool,
}

impl Mp4FileSink {
    pub fn create(path: &Path, fps: u32) -> Result<Self, RecordError> {
        let file = File::create(path).map_err(|source| RecordError::CreateContainer {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Mp4Config {
            major_brand: brand("isom")?,
            minor_version: 512,
            compatible_brands: vec![
                brand("isom")?,
                brand("iso2")?,
                brand("avc1")?,
                brand("mp41")?,
            ],
            timescale: MOVIE_TIMESCALE,
        };
        let writer = Mp4Writer::write_start(BufWriter::new(file), &config)
            .context("failed to start MP4 writer")?;

        Ok(Self {
            path: path.to_path_buf(),
            fps: fps.max(1),
            writer,
            track_added: false,
            started: false,
        })
    }
}

impl SampleSink for Mp4FileSink {
    fn add_track(&mut self, format: &VideoFormat) -> Result<(), RecordError> {
        if self.track_added {
            return Err(RecordError::Lifecycle("video track already added"));
        }
        if format.sps.is_empty() || format.pps.is_empty() {
            return Err(anyhow!("stream format carries no parameter sets").into());
        }
        self.writer
            .add_track(&TrackConfig {
                track_type: TrackType::Video,
                timescale: TRACK_TIMESCALE,
                language: String::from("und"),
                media_conf: MediaConfig::AvcConfig(AvcConfig {
                    width: format.width as u16,
                    height: format.height as u16,
                    seq_param_set: format.sps.clone(),
                    pic_param_set: format.pps.clone(),
                }),
            })
            .context("failed to add video track")?;
        self.track_added = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecordError> {
        if !self.track_added {
            return Err(RecordError::Lifecycle(
                "cannot start writing before a track is added",
            ));
        }
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, sample: &EncodedSample) -> Result<(), RecordError> {
        if !self.started {
            return Err(RecordError::Lifecycle(
                "sample written before the sink was started",
            ));
        }
        let payload: Bytes = annex_b_to_avcc(&sample.data);
        if payload.is_empty() {
            debug!(pts = sample.pts_us, "skipping sample with no slice data");
            return Ok(());
        }
        self.writer
            .write_sample(
                1,
                &Mp4Sample {
                    start_time: sample.pts_us.max(0) as u64,
                    duration: TRACK_TIMESCALE / self.fps,
                    rendering_offset: 0,
                    is_sync: sample.keyframe,
                    bytes: payload,
                },
            )
            .context("failed to write sample")?;
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<PathBuf, RecordError> {
        self.writer.write_end().context("failed to finalize MP4")?;
        Ok(self.path)
    }
}

fn brand(tag: &str) -> Result<FourCC, RecordError> {
    tag.parse()
        .map_err(|_| RecordError::Other(anyhow!("invalid brand tag {tag:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

    fn format() -> VideoFormat {
        VideoFormat {
            width: 64,
            height: 48,
            sps: SPS.to_vec(),
            pps: PPS.to_vec(),
        }
    }

    fn idr_sample(pts_us: i64) -> EncodedSample {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00]);
        EncodedSample {
            data: Bytes::from(data),
            pts_us,
            keyframe: true,
        }
    }

    #[test]
    fn writes_a_readable_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");

        let mut sink: Box<dyn SampleSink> =
            Box::new(Mp4FileSink::create(&path, 30).unwrap());
        sink.add_track(&format()).unwrap();
        sink.start().unwrap();
        for i in 0..3 {
            sink.write_sample(&idr_sample(i * 33_333)).unwrap();
        }
        let finished = sink.finalize().unwrap();

        assert_eq!(finished, path);
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);

        let file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).unwrap();
        assert_eq!(reader.tracks().len(), 1);
    }

    #[test]
    fn track_can_only_be_added_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");

        let mut sink = Mp4FileSink::create(&path, 30).unwrap();
        sink.add_track(&format()).unwrap();
        assert!(sink.add_track(&format()).is_err());
    }

    #[test]
    fn writing_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");

        let mut sink = Mp4FileSink::create(&path, 30).unwrap();
        sink.add_track(&format()).unwrap();
        assert!(sink.write_sample(&idr_sample(0)).is_err());
    }

    #[test]
    fn start_requires_a_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");

        let mut sink = Mp4FileSink::create(&path, 30).unwrap();
        assert!(sink.start().is_err());
    }
}
