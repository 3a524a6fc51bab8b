//! H.264 elementary-stream handling for the encoder drain path.
//!
//! The encoder emits an Annex B byte stream. This module splits it into NAL
//! units, groups them into access units on delimiter boundaries, captures
//! the parameter sets for the container track, and repackages access units
//! into the length-prefixed form MP4 samples require.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// NAL unit classification, reduced to what an encoder output carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NalKind {
    /// Non-IDR slice (P frame).
    SliceNonIdr,
    /// IDR slice (keyframe).
    SliceIdr,
    /// Supplemental enhancement information.
    Sei,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// Access unit delimiter.
    AccessUnitDelimiter,
    /// Filler data.
    Filler,
    Other(u8),
}

impl NalKind {
    pub fn of(header: u8) -> Self {
        match header & 0x1F {
            1 => NalKind::SliceNonIdr,
            5 => NalKind::SliceIdr,
            6 => NalKind::Sei,
            7 => NalKind::Sps,
            8 => NalKind::Pps,
            9 => NalKind::AccessUnitDelimiter,
            12 => NalKind::Filler,
            n => NalKind::Other(n),
        }
    }

    pub fn is_keyframe(self) -> bool {
        matches!(self, NalKind::SliceIdr)
    }

    pub fn is_slice(self) -> bool {
        matches!(self, NalKind::SliceNonIdr | NalKind::SliceIdr)
    }

    /// Whether this unit belongs in a container sample payload. Parameter
    /// sets live in the track configuration and delimiters are framing only.
    pub fn belongs_in_sample(self) -> bool {
        matches!(
            self,
            NalKind::SliceNonIdr | NalKind::SliceIdr | NalKind::Sei
        )
    }
}

/// A NAL unit without its start code, header byte included.
#[derive(Clone, Debug)]
pub struct NalUnit {
    pub kind: NalKind,
    pub data: Bytes,
}

impl NalUnit {
    pub fn parse(data: Bytes) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            kind: NalKind::of(header),
            data,
        })
    }
}

/// Pending-byte cap so a corrupt stream cannot grow the buffer unbounded.
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Streaming splitter for Annex B data (0x000001 / 0x00000001 start codes).
/// Bytes of an incomplete trailing unit stay buffered until the next start
/// code arrives or the stream is flushed.
pub struct AnnexBSplitter {
    buffer: BytesMut,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feed a chunk and pop every NAL unit it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<NalUnit> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_PENDING_BYTES {
            warn!(
                "H.264 splitter exceeded {} pending bytes, resetting",
                MAX_PENDING_BYTES
            );
            self.buffer.clear();
            return Vec::new();
        }

        let mut units = Vec::new();
        loop {
            let Some(start) = self.find_start_code(0) else {
                break;
            };
            let payload_start = start + self.start_code_len(start);
            let Some(next) = self.find_start_code(payload_start) else {
                // Trailing unit still incomplete; discard any junk before
                // the start code and wait for more data.
                if start > 0 {
                    let _ = self.buffer.split_to(start);
                }
                break;
            };

            let _ = self.buffer.split_to(payload_start);
            let payload = self.buffer.split_to(next - payload_start).freeze();
            if let Some(unit) = NalUnit::parse(payload) {
                units.push(unit);
            }
        }
        units
    }

    /// Emit whatever remains as the final unit once the stream has ended.
    pub fn flush(&mut self) -> Option<NalUnit> {
        let payload_start = match self.find_start_code(0) {
            Some(start) => start + self.start_code_len(start),
            None => 0,
        };
        if payload_start >= self.buffer.len() {
            self.buffer.clear();
            return None;
        }

        let _ = self.buffer.split_to(payload_start);
        NalUnit::parse(self.buffer.split().freeze())
    }

    fn find_start_code(&self, offset: usize) -> Option<usize> {
        let buf = &self.buffer;
        if buf.len() < offset + 3 {
            return None;
        }
        for i in offset..buf.len() - 2 {
            if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
                // A 0x00000001 start code is reported at its first zero.
                if i > offset && buf[i - 1] == 0 {
                    return Some(i - 1);
                }
                return Some(i);
            }
        }
        None
    }

    fn start_code_len(&self, pos: usize) -> usize {
        if pos + 3 < self.buffer.len()
            && self.buffer[pos] == 0
            && self.buffer[pos + 1] == 0
            && self.buffer[pos + 2] == 0
            && self.buffer[pos + 3] == 1
        {
            4
        } else {
            3
        }
    }
}

impl Default for AnnexBSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// One access unit: every NAL unit belonging to a single coded picture.
#[derive(Debug)]
pub struct AccessUnit {
    pub nals: Vec<NalUnit>,
}

impl AccessUnit {
    pub fn keyframe(&self) -> bool {
        self.nals.iter().any(|nal| nal.kind.is_keyframe())
    }

    /// Re-serialize as Annex B with four-byte start codes.
    pub fn to_annex_b(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in &self.nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&nal.data);
        }
        out.freeze()
    }
}

/// Groups a NAL stream into access units on delimiter boundaries and records
/// the first parameter sets it sees.
pub struct AccessUnitAssembler {
    current: Vec<NalUnit>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self {
            current: Vec::new(),
            sps: None,
            pps: None,
        }
    }

    /// Feed one unit; returns a completed access unit when a delimiter
    /// closes a group that contains at least one slice.
    pub fn push(&mut self, nal: NalUnit) -> Option<AccessUnit> {
        match nal.kind {
            NalKind::AccessUnitDelimiter => {
                let finished = self.take_current();
                self.current.push(nal);
                finished
            }
            NalKind::Sps => {
                self.sps.get_or_insert_with(|| nal.data.clone());
                self.current.push(nal);
                None
            }
            NalKind::Pps => {
                self.pps.get_or_insert_with(|| nal.data.clone());
                self.current.push(nal);
                None
            }
            _ => {
                self.current.push(nal);
                None
            }
        }
    }

    /// Close out the trailing access unit at end of stream.
    pub fn finish(&mut self) -> Option<AccessUnit> {
        self.take_current()
    }

    /// The first SPS/PPS pair observed, once both are known.
    pub fn parameter_sets(&self) -> Option<(Bytes, Bytes)> {
        Some((self.sps.clone()?, self.pps.clone()?))
    }

    fn take_current(&mut self) -> Option<AccessUnit> {
        if !self.current.iter().any(|nal| nal.kind.is_slice()) {
            // Nothing renderable yet (for example a leading delimiter or a
            // bare parameter-set group); keep accumulating.
            return None;
        }
        Some(AccessUnit {
            nals: std::mem::take(&mut self.current),
        })
    }
}

impl Default for AccessUnitAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an Annex B access unit into the length-prefixed (AVCC) sample
/// payload MP4 tracks expect. Parameter sets, delimiters and filler are
/// dropped; they are carried by the track configuration instead.
pub fn annex_b_to_avcc(data: &[u8]) -> Bytes {
    let mut splitter = AnnexBSplitter::new();
    let mut units = splitter.push(data);
    if let Some(last) = splitter.flush() {
        units.push(last);
    }

    let mut out = BytesMut::new();
    for unit in units {
        if !unit.kind.belongs_in_sample() {
            continue;
        }
        out.put_u32(unit.data.len() as u32);
        out.extend_from_slice(&unit.data);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];
    const AUD: &[u8] = &[0x09, 0xF0];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
    const SLICE: &[u8] = &[0x41, 0x9A, 0x24];

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn kinds_parse_from_headers() {
        assert_eq!(NalKind::of(0x65), NalKind::SliceIdr);
        assert_eq!(NalKind::of(0x67), NalKind::Sps);
        assert_eq!(NalKind::of(0x68), NalKind::Pps);
        assert_eq!(NalKind::of(0x41), NalKind::SliceNonIdr);
        assert_eq!(NalKind::of(0x09), NalKind::AccessUnitDelimiter);
        assert!(NalKind::SliceIdr.is_keyframe());
        assert!(!NalKind::Sps.is_keyframe());
    }

    #[test]
    fn splitter_pops_complete_units_and_flushes_the_tail() {
        let stream = annex_b(&[SPS, PPS, IDR]);
        let mut splitter = AnnexBSplitter::new();
        let units = splitter.push(&stream);

        // The IDR has no trailing start code yet, so it stays buffered.
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, NalKind::Sps);
        assert_eq!(units[1].kind, NalKind::Pps);

        let tail = splitter.flush().unwrap();
        assert_eq!(tail.kind, NalKind::SliceIdr);
        assert_eq!(&tail.data[..], IDR);
    }

    #[test]
    fn splitter_handles_chunks_split_mid_start_code() {
        let stream = annex_b(&[AUD, IDR, AUD, SLICE]);
        let mut splitter = AnnexBSplitter::new();

        let mut units = Vec::new();
        for chunk in stream.chunks(3) {
            units.extend(splitter.push(chunk));
        }
        if let Some(last) = splitter.flush() {
            units.push(last);
        }

        let kinds: Vec<NalKind> = units.iter().map(|u| u.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NalKind::AccessUnitDelimiter,
                NalKind::SliceIdr,
                NalKind::AccessUnitDelimiter,
                NalKind::SliceNonIdr,
            ]
        );
    }

    #[test]
    fn splitter_recognizes_three_byte_start_codes() {
        let mut stream = vec![0, 0, 1];
        stream.extend_from_slice(AUD);
        stream.extend_from_slice(&[0, 0, 1]);
        stream.extend_from_slice(SLICE);

        let mut splitter = AnnexBSplitter::new();
        let mut units = splitter.push(&stream);
        if let Some(last) = splitter.flush() {
            units.push(last);
        }

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, NalKind::AccessUnitDelimiter);
        assert_eq!(units[1].kind, NalKind::SliceNonIdr);
    }

    #[test]
    fn assembler_groups_on_delimiters_and_records_parameters() {
        let stream = annex_b(&[AUD, SPS, PPS, IDR, AUD, SLICE, AUD, SLICE]);
        let mut splitter = AnnexBSplitter::new();
        let mut assembler = AccessUnitAssembler::new();

        let mut units = splitter.push(&stream);
        if let Some(last) = splitter.flush() {
            units.push(last);
        }

        let mut access_units = Vec::new();
        for unit in units {
            if let Some(finished) = assembler.push(unit) {
                access_units.push(finished);
            }
        }
        if let Some(finished) = assembler.finish() {
            access_units.push(finished);
        }

        assert_eq!(access_units.len(), 3);
        assert!(access_units[0].keyframe());
        assert!(!access_units[1].keyframe());
        assert!(!access_units[2].keyframe());

        let (sps, pps) = assembler.parameter_sets().unwrap();
        assert_eq!(&sps[..], SPS);
        assert_eq!(&pps[..], PPS);
    }

    #[test]
    fn avcc_conversion_drops_framing_and_prefixes_lengths() {
        let stream = annex_b(&[AUD, SPS, PPS, IDR]);
        let avcc = annex_b_to_avcc(&stream);

        // Only the IDR slice survives, with a 4-byte big-endian length.
        let mut expected = Vec::new();
        expected.extend_from_slice(&(IDR.len() as u32).to_be_bytes());
        expected.extend_from_slice(IDR);
        assert_eq!(&avcc[..], &expected[..]);
    }
}
