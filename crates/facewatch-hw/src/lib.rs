//! facewatch-hw: frame sources.
//!
//! V4L2 camera capture for the live feed, and still-image decoding for
//! enrollment uploads. Everything is converted to 8-bit grayscale.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use source::VideoSource;
