//! Camera-frame to model-input conversion.
//!
//! Converts a [`FrameBuffer`] in either a multi-plane 4:2:0 luma/chroma
//! layout or a single interleaved BGRA layout into a fixed-size normalized
//! RGB tensor using nearest-neighbor sampling and the BT.601 transform.

use thiserror::Error;

use crate::frame::{FrameBuffer, Plane};

/// Square input size expected by the detector.
pub const MODEL_INPUT_SIZE: usize = 640;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("frame has no pixel planes")]
    NoPlanes,
    #[error("frame has degenerate geometry ({width}x{height})")]
    EmptyFrame { width: usize, height: usize },
}

/// Row-major, channel-interleaved RGB float tensor with values in [0, 1].
pub struct Tensor {
    side: usize,
    data: Vec<f32>,
}

impl Tensor {
    fn zeroed(side: usize) -> Self {
        Self {
            side,
            data: vec![0.0; side * side * 3],
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Convert `frame` into a `target_size` × `target_size` × 3 float tensor.
///
/// Destination pixel (dx, dy) samples source pixel
/// (⌊dx·w/target⌋, ⌊dy·h/target⌋), clamped into the source geometry.
pub fn preprocess(
    frame: &FrameBuffer<'_>,
    target_size: usize,
) -> Result<Tensor, PreprocessError> {
    if frame.planes.is_empty() {
        return Err(PreprocessError::NoPlanes);
    }
    if frame.width == 0 || frame.height == 0 || target_size == 0 {
        return Err(PreprocessError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }

    let mut tensor = Tensor::zeroed(target_size);
    if frame.planes.len() >= 3 {
        fill_from_yuv420(frame, &mut tensor);
    } else {
        fill_from_bgra(frame, &mut tensor);
    }
    Ok(tensor)
}

/// 4:2:0 path: plane 0 is luma, planes 1 and 2 are chroma subsampled by two
/// in both dimensions. BT.601 conversion, channels clamped then normalized.
fn fill_from_yuv420(frame: &FrameBuffer<'_>, tensor: &mut Tensor) {
    let luma = &frame.planes[0];
    let cb = &frame.planes[1];
    let cr = &frame.planes[2];

    let luma_stride = luma.bytes_per_row.unwrap_or(frame.width);
    let cb_stride = cb.bytes_per_row.unwrap_or(frame.width / 2);
    let cr_stride = cr.bytes_per_row.unwrap_or(frame.width / 2);
    let cb_step = cb.bytes_per_pixel.unwrap_or(1);
    let cr_step = cr.bytes_per_pixel.unwrap_or(1);

    let side = tensor.side;
    for dy in 0..side {
        let src_y = (dy * frame.height / side).min(frame.height - 1);
        for dx in 0..side {
            let src_x = (dx * frame.width / side).min(frame.width - 1);

            let y = read_clamped(luma.bytes, src_y * luma_stride + src_x) as f32;
            let chroma_x = src_x / 2;
            let chroma_y = src_y / 2;
            let u = read_clamped(cb.bytes, chroma_y * cb_stride + chroma_x * cb_step) as f32
                - 128.0;
            let v = read_clamped(cr.bytes, chroma_y * cr_stride + chroma_x * cr_step) as f32
                - 128.0;

            let r = (y + 1.402 * v).clamp(0.0, 255.0);
            let g = (y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0);
            let b = (y + 1.772 * u).clamp(0.0, 255.0);

            let idx = (dy * side + dx) * 3;
            tensor.data[idx] = r / 255.0;
            tensor.data[idx + 1] = g / 255.0;
            tensor.data[idx + 2] = b / 255.0;
        }
    }
}

/// Single-plane path: 4-byte interleaved B,G,R,A. A source offset past the
/// end of the buffer leaves the destination pixel at zero rather than
/// failing the frame.
fn fill_from_bgra(frame: &FrameBuffer<'_>, tensor: &mut Tensor) {
    let plane: &Plane<'_> = &frame.planes[0];
    let stride = plane.bytes_per_row.unwrap_or(frame.width * 4);

    let side = tensor.side;
    for dy in 0..side {
        let src_y = (dy * frame.height / side).min(frame.height - 1);
        for dx in 0..side {
            let src_x = (dx * frame.width / side).min(frame.width - 1);

            let offset = src_y * stride + src_x * 4;
            if offset + 2 >= plane.bytes.len() {
                continue;
            }

            let b = plane.bytes[offset] as f32;
            let g = plane.bytes[offset + 1] as f32;
            let r = plane.bytes[offset + 2] as f32;

            let idx = (dy * side + dx) * 3;
            tensor.data[idx] = r / 255.0;
            tensor.data[idx + 1] = g / 255.0;
            tensor.data[idx + 2] = b / 255.0;
        }
    }
}

/// Read a byte with the index clamped into the slice, zero for empty slices.
fn read_clamped(bytes: &[u8], index: usize) -> u8 {
    match bytes.get(index) {
        Some(value) => *value,
        None => bytes.last().copied().unwrap_or(0),
    }
}
