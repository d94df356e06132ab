//! rollcall-hw: camera capture for the presence pipeline.
//!
//! Provides V4L2-based camera access and the [`FrameSource`] capture thread
//! that exposes the single latest frame to the rest of the pipeline.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Opener, MAX_DEVICE_INDEX};
pub use frame::Frame;
pub use source::{CaptureDevice, DeviceOpener, FrameSource, SourceError, SourceSettings};
