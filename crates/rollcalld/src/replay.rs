//! Still-image replay device.
//!
//! Serves one grayscale image as a live camera at a fixed frame interval, so
//! the pipeline can run without hardware (CLI `--replay`, tests).

use image::GrayImage;
use rollcall_hw::{CameraError, CaptureDevice, DeviceOpener, Frame};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Opens [`ReplayDevice`]s for a configured set of indices.
#[derive(Clone)]
pub struct ReplayOpener {
    image: Arc<Mutex<GrayImage>>,
    frame_interval: Duration,
    indices: Option<Vec<u32>>,
}

impl ReplayOpener {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image: Arc::new(Mutex::new(image)),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            indices: None,
        }
    }

    /// Decode any format the `image` crate reads and convert to grayscale.
    pub fn from_path(path: &Path) -> Result<Self, image::ImageError> {
        Ok(Self::new(image::open(path)?.to_luma8()))
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Restrict which indices open successfully; all others fail as missing.
    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// Swap the image served by every open device from the next frame on.
    pub fn set_image(&self, image: GrayImage) {
        *self.image.lock().unwrap_or_else(PoisonError::into_inner) = image;
    }
}

impl DeviceOpener for ReplayOpener {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        if let Some(indices) = &self.indices {
            if !indices.contains(&index) {
                return Err(CameraError::DeviceNotFound(format!("replay:{index}")));
            }
        }
        Ok(Box::new(ReplayDevice {
            index,
            image: Arc::clone(&self.image),
            frame_interval: self.frame_interval,
            next_due: None,
            sequence: 0,
        }))
    }
}

pub struct ReplayDevice {
    index: u32,
    image: Arc<Mutex<GrayImage>>,
    frame_interval: Duration,
    next_due: Option<Instant>,
    sequence: u32,
}

impl CaptureDevice for ReplayDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        // Pace like a camera: block until the next frame is due.
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.frame_interval);

        let image = self.image.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let (width, height) = image.dimensions();
        self.sequence = self.sequence.wrapping_add(1);
        Frame::from_gray(image.into_raw(), width, height, self.sequence)
            .ok_or_else(|| CameraError::CaptureFailed("replay image has inconsistent size".into()))
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.index)
    }
}
