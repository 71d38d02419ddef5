use crate::camera::CameraError;
use crate::frame::Frame;

/// A live frame source the detection loop samples from.
pub trait VideoSource: Send {
    /// Grab the most recent frame.
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;

    /// Release the device. Captures after `stop` fail with [`CameraError::Stopped`].
    /// Calling it twice is harmless.
    fn stop(&mut self);

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}
