//! Borrowed camera-frame views shared by the detection and recording paths.

/// One raw pixel plane of a camera frame.
///
/// Layout metadata is optional; readers fall back to geometrically inferred
/// values (full-width luma stride, half-width chroma stride, pixel stride 1)
/// when the capture source did not report it.
#[derive(Clone, Copy)]
pub struct Plane<'a> {
    pub bytes: &'a [u8],
    pub bytes_per_row: Option<usize>,
    pub bytes_per_pixel: Option<usize>,
}

impl<'a> Plane<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            bytes_per_row: None,
            bytes_per_pixel: None,
        }
    }

    pub fn with_layout(
        bytes: &'a [u8],
        bytes_per_row: Option<usize>,
        bytes_per_pixel: Option<usize>,
    ) -> Self {
        Self {
            bytes,
            bytes_per_row,
            bytes_per_pixel,
        }
    }
}

/// Immutable view over one camera frame's plane data plus geometry.
///
/// Owned by the caller and only valid for the duration of a single call.
/// Three or more planes are treated as 4:2:0 luma/chroma; otherwise plane 0
/// is treated as interleaved B,G,R,A. The byte lengths carry no guarantees
/// relative to the geometry, so every pixel read clamps its computed index.
pub struct FrameBuffer<'a> {
    pub width: usize,
    pub height: usize,
    pub planes: Vec<Plane<'a>>,
}

/// Deep copy of a [`FrameBuffer`], made once per detection call so the
/// inference worker can outlive the caller's borrow.
pub struct OwnedFrame {
    width: usize,
    height: usize,
    planes: Vec<OwnedPlane>,
}

struct OwnedPlane {
    bytes: Vec<u8>,
    bytes_per_row: Option<usize>,
    bytes_per_pixel: Option<usize>,
}

impl OwnedFrame {
    pub fn copy_of(frame: &FrameBuffer<'_>) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            planes: frame
                .planes
                .iter()
                .map(|plane| OwnedPlane {
                    bytes: plane.bytes.to_vec(),
                    bytes_per_row: plane.bytes_per_row,
                    bytes_per_pixel: plane.bytes_per_pixel,
                })
                .collect(),
        }
    }

    pub fn view(&self) -> FrameBuffer<'_> {
        FrameBuffer {
            width: self.width,
            height: self.height,
            planes: self
                .planes
                .iter()
                .map(|plane| Plane {
                    bytes: &plane.bytes,
                    bytes_per_row: plane.bytes_per_row,
                    bytes_per_pixel: plane.bytes_per_pixel,
                })
                .collect(),
        }
    }
}
