//! Pluggable inference backend seam.
//!
//! The detector itself is a black box injected by the host. Backends come in
//! two shapes: one returns the raw per-anchor score grid that still needs
//! decoding and NMS, the other returns already-ranked detections.

use anyhow::{bail, Result};

use crate::decode::Detection;
use crate::preprocess::Tensor;

/// Raw detector output: `attrs` rows (cx, cy, w, h, then one score row per
/// class) of `anchors` values each, flattened row-major.
pub struct GridOutput {
    attrs: usize,
    anchors: usize,
    values: Vec<f32>,
}

impl GridOutput {
    pub fn new(attrs: usize, anchors: usize, values: Vec<f32>) -> Result<Self> {
        if attrs < 5 {
            bail!("grid output requires at least 5 rows (x,y,w,h,score), got {attrs}");
        }
        if anchors == 0 {
            bail!("grid output has no anchors");
        }
        if values.len() != attrs * anchors {
            bail!(
                "grid output size mismatch: got {} values, expected {}",
                values.len(),
                attrs * anchors
            );
        }
        Ok(Self {
            attrs,
            anchors,
            values,
        })
    }

    pub fn anchors(&self) -> usize {
        self.anchors
    }

    pub fn num_classes(&self) -> usize {
        self.attrs - 4
    }

    /// Value of attribute row `attr` at anchor column `anchor`.
    pub fn at(&self, attr: usize, anchor: usize) -> f32 {
        self.values[attr * self.anchors + anchor]
    }
}

/// What a backend produced for one frame.
pub enum BackendOutput {
    /// Raw score grid; goes through decoding and NMS.
    Grid(GridOutput),
    /// Ranked detections in the public coordinate convention; used as-is.
    Ranked(Vec<Detection>),
}

/// A loaded inference backend. Implementations are not assumed to be
/// thread-safe; the detection worker owns the backend and serializes calls.
pub trait DetectorBackend: Send {
    fn infer(&mut self, input: &Tensor) -> Result<BackendOutput>;
}
