//! Raw detector-output decoding and non-maximum suppression.

use serde::Serialize;

use crate::backend::GridOutput;
use crate::preprocess::MODEL_INPUT_SIZE;

/// Decoding thresholds and the pixel space the detector works in.
#[derive(Clone, Copy, Debug)]
pub struct DecoderConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            input_size: MODEL_INPUT_SIZE,
        }
    }
}

/// Final detection in normalized top-left-origin coordinates: (x, y) is the
/// box center, all fields in [0, 1].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Candidate carried through filtering and suppression.
#[derive(Clone, Copy)]
struct RawDetection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
}

/// Decode the raw score grid into the final detection set.
///
/// Anchors whose best class score does not exceed the confidence threshold
/// are discarded (a score exactly at the threshold does not survive), boxes
/// are normalized by the detector input size, degenerate boxes are rejected,
/// and greedy NMS keeps the highest-confidence box of each overlapping
/// cluster. Output is ordered by descending confidence.
pub fn decode(output: &GridOutput, config: &DecoderConfig) -> Vec<Detection> {
    let size = config.input_size as f32;

    let mut candidates = Vec::new();
    for anchor in 0..output.anchors() {
        let mut confidence = 0.0f32;
        for class in 0..output.num_classes() {
            confidence = confidence.max(output.at(4 + class, anchor));
        }
        if confidence <= config.confidence_threshold {
            continue;
        }

        let x = output.at(0, anchor) / size;
        let y = output.at(1, anchor) / size;
        let width = output.at(2, anchor) / size;
        let height = output.at(3, anchor) / size;

        if width <= 0.0 || height <= 0.0 || width > 1.0 || height > 1.0 {
            continue;
        }
        if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
            continue;
        }

        candidates.push(RawDetection {
            x,
            y,
            width,
            height,
            confidence,
        });
    }

    if candidates.is_empty() {
        return Vec::new();
    }

    // Stable sort: equal confidences keep their original anchor order.
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    non_max_suppression(&candidates, config.iou_threshold)
}

/// Greedy suppression over confidence-sorted candidates.
fn non_max_suppression(sorted: &[RawDetection], iou_threshold: f32) -> Vec<Detection> {
    let mut suppressed = vec![false; sorted.len()];
    let mut kept = Vec::new();

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        let winner = sorted[i];
        kept.push(Detection {
            x: winner.x,
            y: winner.y,
            width: winner.width,
            height: winner.height,
            confidence: winner.confidence,
        });

        for j in i + 1..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&winner, &sorted[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    kept
}

/// Intersection over union of two center-format boxes; 0 when the union has
/// no area.
fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let a_left = a.x - a.width / 2.0;
    let a_top = a.y - a.height / 2.0;
    let a_right = a.x + a.width / 2.0;
    let a_bottom = a.y + a.height / 2.0;

    let b_left = b.x - b.width / 2.0;
    let b_top = b.y - b.height / 2.0;
    let b_right = b.x + b.width / 2.0;
    let b_bottom = b.y + b.height / 2.0;

    let inter_width = (a_right.min(b_right) - a_left.max(b_left)).max(0.0);
    let inter_height = (a_bottom.min(b_bottom) - a_top.max(b_top)).max(0.0);
    let inter_area = inter_width * inter_height;

    let union_area = a.width * a.height + b.width * b.height - inter_area;
    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
