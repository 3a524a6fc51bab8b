//! Camera-frame object detection core.
//!
//! The crate is split into focused modules:
//! - `frame`: borrowed plane/frame views handed across the host boundary.
//! - `preprocess`: pixel-format conversion and resize into the model tensor.
//! - `backend`: the pluggable inference seam and its two output shapes.
//! - `decode`: raw-grid decoding and non-maximum suppression.
//! - `worker`: the dedicated thread that serializes backend access.

pub use backend::{BackendOutput, DetectorBackend, GridOutput};
pub use decode::{decode, DecoderConfig, Detection};
pub use frame::{FrameBuffer, OwnedFrame, Plane};
pub use preprocess::{preprocess, PreprocessError, Tensor, MODEL_INPUT_SIZE};
pub use worker::{DetectionReceipt, DetectionWorker};

mod backend;
mod decode;
mod frame;
mod preprocess;
mod worker;
