//! Latest-frame source: a capture thread that keeps only the newest frame.
//!
//! The capture loop overwrites a single slot on every successful read. There
//! is no queue; consumers that fall behind simply see the newest frame.

use crate::camera::{CameraError, MAX_DEVICE_INDEX};
use crate::frame::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// A device that yields grayscale frames, one blocking read at a time.
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable identification for logs.
    fn describe(&self) -> String;
}

/// Opens capture devices by numeric index.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("camera {index} unavailable: {reason}")]
    DeviceUnavailable { index: u32, reason: String },
    #[error("camera {device} disconnected after {failures} consecutive failed reads")]
    Disconnected { device: String, failures: u32 },
}

/// Tunables for [`FrameSource`].
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Indices tried, in order, when the requested one cannot be opened.
    pub fallback_indices: Vec<u32>,
    /// Pause after a failed read.
    pub failure_backoff: Duration,
    /// Consecutive failed reads after which the source gives up.
    pub max_consecutive_failures: u32,
    /// Upper bound on how long `stop()` waits for the capture thread.
    pub stop_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            fallback_indices: vec![0, 1, 2],
            failure_backoff: Duration::from_millis(50),
            max_consecutive_failures: 30,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// State shared between the capture thread and readers.
struct Shared {
    latest: Mutex<Option<Frame>>,
    fault: Mutex<Option<SourceError>>,
    running: AtomicBool,
}

/// Handle to a running capture thread.
pub struct FrameSource {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    opened_index: u32,
    description: String,
    stop_timeout: Duration,
}

impl FrameSource {
    /// Open `index` (or a fallback) and start the capture thread.
    ///
    /// Each candidate is validated by reading one frame before it is accepted.
    /// An index beyond the V4L2 range is rejected without trying fallbacks.
    pub fn start(
        opener: &dyn DeviceOpener,
        index: u32,
        settings: &SourceSettings,
    ) -> Result<Self, SourceError> {
        if index > MAX_DEVICE_INDEX {
            return Err(SourceError::DeviceUnavailable {
                index,
                reason: format!("index out of range (0..={MAX_DEVICE_INDEX})"),
            });
        }

        let mut candidates = vec![index];
        for &alt in &settings.fallback_indices {
            if alt <= MAX_DEVICE_INDEX && !candidates.contains(&alt) {
                candidates.push(alt);
            }
        }

        let mut last_reason = String::from("no candidate device");
        for candidate in candidates {
            match open_and_validate(opener, candidate) {
                Ok((device, first)) => {
                    if candidate != index {
                        tracing::warn!(requested = index, opened = candidate, "using fallback camera");
                    }
                    return Self::spawn(device, first, candidate, settings);
                }
                Err(e) => {
                    tracing::warn!(index = candidate, error = %e, "camera unavailable");
                    last_reason = e.to_string();
                }
            }
        }

        Err(SourceError::DeviceUnavailable {
            index,
            reason: last_reason,
        })
    }

    fn spawn(
        device: Box<dyn CaptureDevice>,
        first: Frame,
        opened_index: u32,
        settings: &SourceSettings,
    ) -> Result<Self, SourceError> {
        let description = device.describe();
        let shared = Arc::new(Shared {
            latest: Mutex::new(Some(first)),
            fault: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

        let loop_shared = Arc::clone(&shared);
        let loop_settings = settings.clone();
        let handle = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                // Dropped on exit, panics included, which wakes `stop()`.
                let _done = done_tx;
                capture_loop(device, &loop_shared, &stop_rx, &loop_settings);
            })
            .map_err(|e| SourceError::DeviceUnavailable {
                index: opened_index,
                reason: format!("failed to spawn capture thread: {e}"),
            })?;

        tracing::info!(index = opened_index, device = %description, "frame source started");

        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
            opened_index,
            description,
            stop_timeout: settings.stop_timeout,
        })
    }

    /// Newest captured frame, if any. Only waits for the slot lock, never for capture.
    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.shared.latest).clone()
    }

    /// Whether the capture loop is still running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The fault that made the capture loop stop on its own, if any.
    pub fn fault(&self) -> Option<SourceError> {
        lock(&self.shared.fault).clone()
    }

    /// Index of the device actually opened (may be a fallback).
    pub fn opened_index(&self) -> u32 {
        self.opened_index
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Stop the capture loop and release the device. Idempotent.
    ///
    /// Waits at most the configured stop timeout; a thread that has not
    /// finished by then is detached and releases the device when it exits.
    pub fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        drop(stop_tx);

        match self.done_rx.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        tracing::warn!(device = %self.description, "capture thread panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    device = %self.description,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "capture thread did not stop in time; detaching"
                );
                self.handle.take();
            }
        }

        self.shared.running.store(false, Ordering::Release);
        lock(&self.shared.latest).take();
        tracing::info!(device = %self.description, "frame source stopped");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_and_validate(
    opener: &dyn DeviceOpener,
    index: u32,
) -> Result<(Box<dyn CaptureDevice>, Frame), CameraError> {
    let mut device = opener.open(index)?;
    let first = device.read_frame()?;
    Ok((device, first))
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    shared: &Shared,
    stop_rx: &Receiver<()>,
    settings: &SourceSettings,
) {
    let mut failures = 0u32;

    loop {
        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        match device.read_frame() {
            Ok(frame) => {
                failures = 0;
                *lock(&shared.latest) = Some(frame);
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(error = %e, failures, "frame read failed");

                if failures >= settings.max_consecutive_failures {
                    let fault = SourceError::Disconnected {
                        device: device.describe(),
                        failures,
                    };
                    tracing::error!(error = %fault, "camera lost; capture loop stopping");
                    *lock(&shared.fault) = Some(fault);
                    break;
                }

                if !matches!(
                    stop_rx.recv_timeout(settings.failure_backoff),
                    Err(RecvTimeoutError::Timeout)
                ) {
                    break;
                }
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    drop(device);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Device that serves `frames` good frames, then fails forever.
    struct ScriptedDevice {
        index: u32,
        frames: Option<usize>,
        served: usize,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            if let Some(limit) = self.frames {
                if self.served >= limit {
                    return Err(CameraError::CaptureFailed("unplugged".into()));
                }
            }
            self.served += 1;
            Ok(Frame::from_gray(vec![128u8; 16], 4, 4, self.served as u32).unwrap())
        }

        fn describe(&self) -> String {
            format!("scripted{}", self.index)
        }
    }

    struct ScriptedOpener {
        good: Vec<u32>,
        frames: Option<usize>,
        opens: AtomicUsize,
    }

    impl ScriptedOpener {
        fn new(good: Vec<u32>) -> Self {
            Self { good, frames: None, opens: AtomicUsize::new(0) }
        }
    }

    impl DeviceOpener for ScriptedOpener {
        fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.good.contains(&index) {
                Ok(Box::new(ScriptedDevice { index, frames: self.frames, served: 0 }))
            } else {
                Err(CameraError::DeviceNotFound(format!("scripted{index}")))
            }
        }
    }

    fn fast_settings() -> SourceSettings {
        SourceSettings {
            fallback_indices: vec![],
            failure_backoff: Duration::from_millis(1),
            max_consecutive_failures: 3,
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_serves_latest_frame() {
        let opener = ScriptedOpener::new(vec![0]);
        let mut source = FrameSource::start(&opener, 0, &fast_settings()).unwrap();
        assert!(source.is_running());
        assert!(source.latest_frame().is_some());
        assert!(wait_until(|| source.latest_frame().map(|f| f.sequence > 1).unwrap_or(false)));
        source.stop();
        assert!(!source.is_running());
        assert!(source.latest_frame().is_none());
    }

    #[test]
    fn test_out_of_range_index_skips_fallbacks() {
        let opener = ScriptedOpener::new(vec![0]);
        let settings = SourceSettings { fallback_indices: vec![0], ..fast_settings() };
        let result = FrameSource::start(&opener, MAX_DEVICE_INDEX + 1, &settings);
        assert!(matches!(result, Err(SourceError::DeviceUnavailable { .. })));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falls_back_to_alternate_index() {
        let opener = ScriptedOpener::new(vec![1]);
        let settings = SourceSettings { fallback_indices: vec![2, 1, 0], ..fast_settings() };
        let source = FrameSource::start(&opener, 5, &settings).unwrap();
        assert_eq!(source.opened_index(), 1);
        // 5 and 2 fail before 1 succeeds
        assert_eq!(opener.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_working_device() {
        let opener = ScriptedOpener::new(vec![]);
        let settings = SourceSettings { fallback_indices: vec![0, 1], ..fast_settings() };
        match FrameSource::start(&opener, 3, &settings) {
            Err(SourceError::DeviceUnavailable { index, .. }) => assert_eq!(index, 3),
            other => panic!("expected DeviceUnavailable, got {:?}", other.map(|s| s.opened_index())),
        }
    }

    #[test]
    fn test_validation_read_failure_rejects_device() {
        let mut opener = ScriptedOpener::new(vec![0]);
        opener.frames = Some(0);
        let result = FrameSource::start(&opener, 0, &fast_settings());
        assert!(matches!(result, Err(SourceError::DeviceUnavailable { .. })));
    }

    #[test]
    fn test_disconnect_self_stops_with_fault() {
        let mut opener = ScriptedOpener::new(vec![0]);
        opener.frames = Some(3);
        let source = FrameSource::start(&opener, 0, &fast_settings()).unwrap();
        assert!(wait_until(|| !source.is_running()));
        assert!(matches!(source.fault(), Some(SourceError::Disconnected { failures: 3, .. })));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let opener = ScriptedOpener::new(vec![0]);
        let mut source = FrameSource::start(&opener, 0, &fast_settings()).unwrap();
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }
}
