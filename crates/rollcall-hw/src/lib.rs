//! rollcall-hw — Frame capture for recognition runs.
//!
//! Provides the grayscale `Frame` type, the `FrameSource` contract the
//! recognition loop pulls from, a V4L2 camera source and an offline replay
//! source.

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameSource};
pub use replay::{is_image_file, ReplaySource};
