//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{CaptureDevice, DeviceOpener};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Highest `/dev/videoN` minor the kernel hands out to V4L2 capture nodes.
pub const MAX_DEVICE_INDEX: u32 = 63;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

/// V4L2 device path for a numeric camera index.
pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

/// V4L2 camera device handle with a persistent mmap stream.
pub struct Camera {
    // Declared before `device` so the stream is torn down first.
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// `width` x `height`. The driver may negotiate a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept GREY or Y16 if that is what the driver settles on.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next frame, converting to grayscale if needed.
    ///
    /// The mmap stream is created on first use and kept for the lifetime of
    /// the camera; a failed dequeue drops it so the next call re-arms it.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
            self.stream = Some(stream);
        }

        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream not armed".into()));
        };

        let dequeued = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))
            .and_then(|(buf, meta)| {
                buf_to_grayscale(buf, width, height, pixel_format).map(|gray| (gray, meta.sequence))
            });

        let (gray, sequence) = match dequeued {
            Ok(v) => v,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        let is_dark = frame::is_dark_frame(&gray, frame::DARK_FRAME_RATIO);
        Ok(Frame {
            data: gray,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for index in 0..=MAX_DEVICE_INDEX {
            let path = device_path(index);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                index,
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CaptureDevice for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} {:?})", self.device_path, self.width, self.height, self.fourcc)
    }
}

/// Convert a raw buffer to grayscale based on the negotiated format.
fn buf_to_grayscale(
    buf: &[u8],
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;

    match pixel_format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
        PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("Y16 conversion failed: {e}"))),
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}

/// Opens numbered `/dev/videoN` nodes as [`Camera`]s.
#[derive(Debug, Clone, Copy)]
pub struct V4l2Opener {
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Opener {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl DeviceOpener for V4l2Opener {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let camera = Camera::open(&device_path(index), self.width, self.height)?;
        Ok(Box::new(camera))
    }
}
