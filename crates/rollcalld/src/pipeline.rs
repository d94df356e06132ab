//! Pipeline controller: owns the frame source, detection loop, gallery and
//! tracked-face view, and drives the Stopped → Starting → Running → Stopping
//! lifecycle.

use crate::annotate::{self, AnnotatedFrame};
use crate::config::Config;
use crate::engine::{DetectionLoop, LoopExit};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::GrayImage;
use rollcall_core::{
    Detector, DetectorError, FaceRegion, Gallery, GalleryError, MatchOutcome, Preprocessor, Stabilizer,
    TrackedFace,
};
use rollcall_hw::{DeviceOpener, Frame, FrameSource, SourceError, V4l2Opener};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline is not running")]
    NotRunning,
    #[error("{0}")]
    DeviceUnavailable(SourceError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn detection thread: {0}")]
    Thread(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of gallery, lifecycle and live-view counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub identities: usize,
    pub samples_per_identity: BTreeMap<String, usize>,
    pub total_samples: usize,
    pub trained: bool,
    pub running: bool,
    pub state: PipelineState,
    pub tracked_faces: usize,
    pub threshold: f32,
    pub device_index: Option<u32>,
    pub last_error: Option<String>,
}

struct Lifecycle {
    state: PipelineState,
    last_error: Option<String>,
    device_index: Option<u32>,
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// A live face presence pipeline.
///
/// All mutable state is owned here; nothing is global. Methods take `&self`
/// so one `Arc<Pipeline>` can be shared between a control surface and
/// readers of the live view.
pub struct Pipeline {
    config: Config,
    opener: Box<dyn DeviceOpener>,
    detector: Arc<Mutex<Detector>>,
    preprocessor: Preprocessor,
    gallery: Arc<Gallery>,
    stabilizer: Arc<Mutex<Stabilizer>>,
    source: Arc<Mutex<Option<FrameSource>>>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    /// Also serializes start and stop.
    worker: Mutex<Option<Worker>>,
    forget_tx: Sender<String>,
    forget_rx: Receiver<String>,
}

impl Pipeline {
    /// Production wiring: detector from the model directory, V4L2 capture,
    /// gallery store at `config.db_path`.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let detector = Detector::from_model_dir(
            &config.model_dir,
            config.detector_params(),
            config.backend_preference(),
        )?;
        let opener = V4l2Opener { width: config.capture_width, height: config.capture_height };
        Ok(Self::new(config, detector, Box::new(opener)))
    }

    /// Pipeline over the gallery stored at `config.db_path`.
    pub fn new(config: Config, detector: Detector, opener: Box<dyn DeviceOpener>) -> Self {
        let gallery = Gallery::open(&config.db_path, config.gallery_params());
        Self::with_parts(config, detector, gallery, opener)
    }

    pub fn with_parts(
        config: Config,
        detector: Detector,
        gallery: Gallery,
        opener: Box<dyn DeviceOpener>,
    ) -> Self {
        let (forget_tx, forget_rx) = crossbeam_channel::unbounded();
        Self {
            preprocessor: Preprocessor::new(config.preprocess_params()),
            stabilizer: Arc::new(Mutex::new(Stabilizer::new(config.stabilizer_params()))),
            detector: Arc::new(Mutex::new(detector)),
            gallery: Arc::new(gallery),
            source: Arc::new(Mutex::new(None)),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: PipelineState::Stopped,
                last_error: None,
                device_index: None,
            })),
            worker: Mutex::new(None),
            forget_tx,
            forget_rx,
            opener,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Open the camera and start the detection loop.
    pub fn start(&self, device_index: u32) -> Result<(), PipelineError> {
        let mut worker = lock(&self.worker);
        {
            let mut lc = lock(&self.lifecycle);
            if lc.state != PipelineState::Stopped {
                return Err(PipelineError::AlreadyRunning);
            }
            lc.state = PipelineState::Starting;
        }

        // A loop that faulted on its own has already exited; reap it.
        if let Some(old) = worker.take() {
            self.join_worker(old);
        }
        self.forget_rx.try_iter().for_each(drop);

        let source = match FrameSource::start(self.opener.as_ref(), device_index, &self.config.source_settings()) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(device = device_index, error = %e, "pipeline start failed");
                let mut lc = lock(&self.lifecycle);
                lc.state = PipelineState::Stopped;
                lc.last_error = Some(e.to_string());
                return Err(PipelineError::DeviceUnavailable(e));
            }
        };
        let opened = source.opened_index();
        let device = source.description().to_string();
        *lock(&self.source) = Some(source);

        match self.spawn_worker() {
            Ok(w) => *worker = Some(w),
            Err(e) => {
                let taken = lock(&self.source).take();
                if let Some(mut source) = taken {
                    source.stop();
                }
                let mut lc = lock(&self.lifecycle);
                lc.state = PipelineState::Stopped;
                lc.last_error = Some(e.to_string());
                return Err(e);
            }
        }

        let mut lc = lock(&self.lifecycle);
        lc.state = PipelineState::Running;
        lc.last_error = None;
        lc.device_index = Some(opened);
        tracing::info!(requested = device_index, opened, device = %device, "pipeline running");
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Worker, PipelineError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

        let detection = DetectionLoop::new(
            Arc::clone(&self.source),
            Arc::clone(&self.detector),
            self.preprocessor.clone(),
            Arc::clone(&self.gallery),
            Arc::clone(&self.stabilizer),
            self.forget_rx.clone(),
            self.config.cycle(),
            self.config.max_consecutive_errors,
        );
        let source = Arc::clone(&self.source);
        let stabilizer = Arc::clone(&self.stabilizer);
        let lifecycle = Arc::clone(&self.lifecycle);

        let handle = std::thread::Builder::new()
            .name("rollcall-detect".into())
            .spawn(move || {
                let _done = done_tx;
                if let LoopExit::Fault(reason) = detection.run(&stop_rx) {
                    // Nobody will call stop() for us; wind down here.
                    let taken = lock(&source).take();
                    if let Some(mut source) = taken {
                        source.stop();
                    }
                    lock(&stabilizer).clear();
                    let mut lc = lock(&lifecycle);
                    lc.state = PipelineState::Stopped;
                    lc.last_error = Some(reason);
                    lc.device_index = None;
                }
            })
            .map_err(|e| PipelineError::Thread(e.to_string()))?;

        Ok(Worker { stop_tx, done_rx, handle })
    }

    /// Stop the detection loop and release the camera. Idempotent.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let mut worker = lock(&self.worker);
        let Some(current) = worker.take() else {
            return Ok(());
        };

        {
            let mut lc = lock(&self.lifecycle);
            if lc.state == PipelineState::Running {
                lc.state = PipelineState::Stopping;
            }
        }

        self.join_worker(current);
        let taken = lock(&self.source).take();
        if let Some(mut source) = taken {
            source.stop();
        }
        lock(&self.stabilizer).clear();
        self.forget_rx.try_iter().for_each(drop);

        let mut lc = lock(&self.lifecycle);
        lc.state = PipelineState::Stopped;
        lc.device_index = None;
        tracing::info!("pipeline stopped");
        Ok(())
    }

    /// Signal the loop and wait for it within the stop timeout; detach on timeout.
    fn join_worker(&self, worker: Worker) {
        let Worker { stop_tx, done_rx, handle } = worker;
        drop(stop_tx);

        let timeout = self.config.stop_timeout();
        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::warn!("detection thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "detection thread did not stop in time; detaching"
                );
            }
        }
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.lifecycle).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Description of the most recent start failure or background fault.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.lifecycle).last_error.clone()
    }

    /// Newest raw frame, if the camera is running.
    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.source).as_ref().and_then(FrameSource::latest_frame)
    }

    /// Copy of the current tracked-face view.
    pub fn detected_faces(&self) -> Vec<TrackedFace> {
        lock(&self.stabilizer).snapshot()
    }

    /// Latest frame with overlays, rendered now.
    pub fn current_annotated_frame(&self) -> Option<AnnotatedFrame> {
        let frame = self.latest_frame()?;
        Some(annotate::render(&frame, &self.detected_faces()))
    }

    /// Like [`current_annotated_frame`](Self::current_annotated_frame), but
    /// JPEG-encoded at the configured quality.
    pub fn snapshot_jpeg(&self) -> Result<Vec<u8>, PipelineError> {
        let annotated = self.current_annotated_frame().ok_or(PipelineError::NotRunning)?;
        Ok(annotated.encode_jpeg(self.config.jpeg_quality)?)
    }

    /// Enroll the largest face in `image`. Returns the identity's sample count.
    pub fn enroll(&self, id: &str, name: &str, image: &GrayImage) -> Result<usize, PipelineError> {
        if id.trim().is_empty() {
            return Err(GalleryError::InvalidIdentity("identity id must not be empty".into()).into());
        }
        // The detection loop shares this detector; release it before the
        // gallery rebuild and store write.
        let samples = {
            let mut detector = lock(&self.detector);
            Gallery::capture_samples(&mut detector, &self.preprocessor, image)?
        };
        Ok(self.gallery.enroll_samples(id, name, samples)?)
    }

    /// Decode an image file and enroll it.
    pub fn enroll_path(&self, id: &str, name: &str, path: &Path) -> Result<usize, PipelineError> {
        let image = image::open(path)?.to_luma8();
        self.enroll(id, name, &image)
    }

    /// Detect every face in a still image and match each one against the
    /// gallery, accepted or not. Faces too close to the border to normalize
    /// carry no outcome.
    pub fn identify_image(
        &self,
        image: &GrayImage,
    ) -> Result<Vec<(FaceRegion, Option<MatchOutcome>)>, PipelineError> {
        if !self.gallery.is_trained() {
            return Err(GalleryError::NotTrained.into());
        }
        let regions = lock(&self.detector).detect(image)?;
        regions
            .into_iter()
            .map(|region| {
                let outcome = match self.preprocessor.normalize(image, &region) {
                    Some(input) => Some(self.gallery.match_face(&input)?),
                    None => None,
                };
                Ok((region, outcome))
            })
            .collect()
    }

    /// Remove an identity. The live view stops reporting it from the next
    /// detection cycle on.
    pub fn unenroll(&self, id: &str) -> Result<(), PipelineError> {
        self.gallery.unenroll(id)?;
        // The receiver lives in self, so this cannot fail.
        let _ = self.forget_tx.send(id.trim().to_string());
        Ok(())
    }

    pub fn set_threshold(&self, threshold: f32) -> f32 {
        self.gallery.set_threshold(threshold)
    }

    pub fn statistics(&self) -> Statistics {
        let gallery = self.gallery.statistics();
        let tracked_faces = lock(&self.stabilizer).len();
        let lc = lock(&self.lifecycle);
        Statistics {
            identities: gallery.identities,
            samples_per_identity: gallery.samples_per_identity,
            total_samples: gallery.total_samples,
            trained: gallery.trained,
            running: lc.state == PipelineState::Running,
            state: lc.state,
            tracked_faces,
            threshold: gallery.threshold,
            device_index: lc.device_index,
            last_error: lc.last_error.clone(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplayOpener;
    use rollcall_core::{BoundingBox, DetectorParams, FaceBackend, FaceRegion, GalleryParams};
    use rollcall_hw::{CameraError, CaptureDevice};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    const FACE: (f32, f32, f32, f32) = (60.0, 60.0, 80.0, 80.0);

    struct FixedFace;

    impl FaceBackend for FixedFace {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            let (x, y, w, h) = FACE;
            Ok(vec![FaceRegion { bbox: BoundingBox::new(x, y, w, h), detector: "fixed", confidence: Some(1.0) }])
        }
    }

    /// Fails every call once `failing` is set.
    struct FlakyFace(Arc<AtomicBool>);

    impl FaceBackend for FlakyFace {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            if self.0.load(Ordering::SeqCst) {
                return Err(DetectorError::InferenceFailed("synthetic failure".into()));
            }
            FixedFace.detect(image)
        }
    }

    struct PanickingFace;

    impl FaceBackend for PanickingFace {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            panic!("backend exploded");
        }
    }

    /// Serves a few frames, then fails forever.
    struct DyingOpener;

    struct DyingDevice(u32);

    impl CaptureDevice for DyingDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            if self.0 == 0 {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            self.0 -= 1;
            Ok(Frame::from_gray(vec![128; 200 * 200], 200, 200, self.0).unwrap())
        }

        fn describe(&self) -> String {
            "dying".into()
        }
    }

    impl DeviceOpener for DyingOpener {
        fn open(&self, _index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
            Ok(Box::new(DyingDevice(5)))
        }
    }

    fn ramp_image(horizontal: bool) -> GrayImage {
        GrayImage::from_fn(200, 200, |x, y| image::Luma([(if horizontal { x } else { y }) as u8]))
    }

    fn test_config() -> Config {
        Config {
            cycle_ms: 10,
            stop_timeout_ms: 2000,
            max_consecutive_errors: 3,
            ..Config::default()
        }
    }

    fn pipeline_with(backend: Box<dyn FaceBackend>, opener: Box<dyn DeviceOpener>) -> Pipeline {
        let detector = Detector::with_backends(vec![backend], DetectorParams::default()).unwrap();
        Pipeline::with_parts(test_config(), detector, Gallery::in_memory(GalleryParams::default()), opener)
    }

    fn replay_pipeline(image: GrayImage) -> (Pipeline, ReplayOpener) {
        let opener = ReplayOpener::new(image)
            .with_frame_interval(Duration::from_millis(5))
            .with_indices(vec![0]);
        (pipeline_with(Box::new(FixedFace), Box::new(opener.clone())), opener)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_enroll_then_identify_live() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));

        let count = pipeline.enroll("S1", "Alice", &ramp_image(true)).unwrap();
        assert_eq!(count, 5);
        assert!(pipeline.statistics().trained);

        pipeline.start(0).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);

        assert!(wait_until(|| pipeline
            .detected_faces()
            .iter()
            .any(|f| f.identity_id() == Some("S1"))));
        let face = pipeline.detected_faces().remove(0);
        assert_eq!(face.label(), "Alice");
        assert!(face.best_similarity >= pipeline.gallery().threshold());

        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.detected_faces().is_empty());
    }

    #[test]
    fn test_unenroll_while_running_reports_unknown() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        pipeline.enroll("S1", "Alice", &ramp_image(true)).unwrap();
        pipeline.start(0).unwrap();
        assert!(wait_until(|| pipeline.detected_faces().iter().any(|f| f.identity_id() == Some("S1"))));

        pipeline.unenroll("S1").unwrap();
        assert!(!pipeline.statistics().trained);

        assert!(wait_until(|| {
            let faces = pipeline.detected_faces();
            !faces.is_empty() && faces.iter().all(|f| f.label() == "Unknown")
        }));
        assert!(matches!(
            pipeline.unenroll("S1"),
            Err(PipelineError::Gallery(GalleryError::NotFound(_)))
        ));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_enroll_and_unenroll_while_running() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        pipeline.start(0).unwrap();
        assert!(wait_until(|| {
            let faces = pipeline.detected_faces();
            !faces.is_empty() && faces.iter().all(|f| f.identity.is_none())
        }));

        assert_eq!(pipeline.enroll(" S1 ", "Alice", &ramp_image(true)).unwrap(), 5);
        assert!(wait_until(|| pipeline.detected_faces().iter().any(|f| f.identity_id() == Some("S1"))));
        assert!(pipeline.is_running());

        pipeline.unenroll(" S1 ").unwrap();
        assert!(wait_until(|| {
            let faces = pipeline.detected_faces();
            !faces.is_empty() && faces.iter().all(|f| f.identity.is_none())
        }));
        assert!(pipeline.last_error().is_none());
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_enroll_releases_detector_before_store_write() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("gallery.db");
        let gallery = Gallery::open(&db, GalleryParams::default());
        let detector = Detector::with_backends(vec![Box::new(FixedFace)], DetectorParams::default()).unwrap();
        let opener = ReplayOpener::new(ramp_image(true));
        let pipeline = Pipeline::with_parts(test_config(), detector, gallery, Box::new(opener));

        // A second connection holds the write lock, so the store write has to wait
        let blocker = rusqlite::Connection::open(&db).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        std::thread::scope(|scope| {
            let enrolling = scope.spawn(|| pipeline.enroll("S1", "Alice", &ramp_image(true)));
            assert!(wait_until(|| pipeline.gallery().contains("S1")));
            assert!(pipeline.detector.try_lock().is_ok(), "detector still locked during the gallery write");

            blocker.execute_batch("COMMIT;").unwrap();
            assert_eq!(enrolling.join().unwrap().unwrap(), 5);
        });
    }

    #[test]
    fn test_invalid_device_then_valid_start() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));

        let err = pipeline.start(999).unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(SourceError::DeviceUnavailable { index: 999, .. })));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.last_error().is_some());
        assert!(pipeline.latest_frame().is_none());

        pipeline.start(0).unwrap();
        assert!(pipeline.is_running());
        assert_eq!(pipeline.statistics().device_index, Some(0));
        assert!(pipeline.last_error().is_none());
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_missing_device_uses_fallback() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        // Only index 0 opens; 5 is in range but absent
        pipeline.start(5).unwrap();
        assert_eq!(pipeline.statistics().device_index, Some(0));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_lifecycle_idempotency() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        pipeline.start(0).unwrap();
        assert!(matches!(pipeline.start(0), Err(PipelineError::AlreadyRunning)));

        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // Restart after a clean stop
        pipeline.start(0).unwrap();
        assert!(pipeline.is_running());
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_annotated_frame_and_snapshot() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        assert!(pipeline.current_annotated_frame().is_none());
        assert!(matches!(pipeline.snapshot_jpeg(), Err(PipelineError::NotRunning)));

        pipeline.start(0).unwrap();
        assert!(wait_until(|| !pipeline.detected_faces().is_empty()));
        let annotated = pipeline.current_annotated_frame().unwrap();
        assert_eq!(annotated.image.dimensions(), (200, 200));
        assert_eq!(annotated.faces, 1);
        assert!(pipeline.snapshot_jpeg().unwrap().starts_with(&[0xff, 0xd8]));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_unknown_face_tracked_without_identity() {
        let (pipeline, opener) = replay_pipeline(ramp_image(true));
        pipeline.enroll("S1", "Alice", &ramp_image(true)).unwrap();
        opener.set_image(ramp_image(false));

        pipeline.start(0).unwrap();
        assert!(wait_until(|| !pipeline.detected_faces().is_empty()));
        assert!(pipeline.detected_faces().iter().all(|f| f.identity.is_none()));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_source_disconnect_faults_to_stopped() {
        let pipeline = pipeline_with(Box::new(FixedFace), Box::new(DyingOpener));
        pipeline.start(0).unwrap();

        assert!(wait_until(|| pipeline.state() == PipelineState::Stopped));
        let error = pipeline.last_error().unwrap();
        assert!(error.contains("disconnected"), "{error}");
        assert!(pipeline.detected_faces().is_empty());

        // stop() after a fault is still fine, and so is a fresh start
        pipeline.stop().unwrap();
        pipeline.start(0).unwrap();
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_repeated_detector_failure_faults() {
        let failing = Arc::new(AtomicBool::new(false));
        let opener = ReplayOpener::new(ramp_image(true)).with_frame_interval(Duration::from_millis(2));
        let pipeline = pipeline_with(Box::new(FlakyFace(Arc::clone(&failing))), Box::new(opener));
        pipeline.start(0).unwrap();
        assert!(wait_until(|| !pipeline.detected_faces().is_empty()));

        failing.store(true, Ordering::SeqCst);
        assert!(wait_until(|| pipeline.state() == PipelineState::Stopped));
        assert!(pipeline.last_error().unwrap().contains("consecutive"));
        assert!(pipeline.latest_frame().is_none());
    }

    #[test]
    fn test_panic_in_cycle_faults() {
        let opener = ReplayOpener::new(ramp_image(true)).with_frame_interval(Duration::from_millis(2));
        let pipeline = pipeline_with(Box::new(PanickingFace), Box::new(opener));
        pipeline.start(0).unwrap();

        assert!(wait_until(|| pipeline.state() == PipelineState::Stopped));
        assert!(pipeline.last_error().unwrap().contains("backend exploded"));

        assert!(pipeline.detected_faces().is_empty());
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_statistics() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        pipeline.enroll("S1", "Alice", &ramp_image(true)).unwrap();
        let stats = pipeline.statistics();
        assert_eq!(stats.identities, 1);
        assert_eq!(stats.samples_per_identity["S1"], 5);
        assert_eq!(stats.total_samples, 5);
        assert!(!stats.running);
        assert_eq!(stats.state, PipelineState::Stopped);
        assert_eq!(stats.tracked_faces, 0);
        assert_eq!(pipeline.set_threshold(0.6), 0.6);
        assert_eq!(pipeline.statistics().threshold, 0.6);
    }

    #[test]
    fn test_identify_image() {
        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        assert!(matches!(
            pipeline.identify_image(&ramp_image(true)),
            Err(PipelineError::Gallery(GalleryError::NotTrained))
        ));

        pipeline.enroll("S1", "Alice", &ramp_image(true)).unwrap();
        let results = pipeline.identify_image(&ramp_image(true)).unwrap();
        assert_eq!(results.len(), 1);
        let outcome = results[0].1.as_ref().unwrap();
        assert_eq!(outcome.id, "S1");
        assert!(outcome.accepted);

        let results = pipeline.identify_image(&ramp_image(false)).unwrap();
        assert!(!results[0].1.as_ref().unwrap().accepted);
    }

    #[test]
    fn test_enroll_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        ramp_image(true).save(&path).unwrap();

        let (pipeline, _opener) = replay_pipeline(ramp_image(true));
        assert_eq!(pipeline.enroll_path("S1", "Alice", &path).unwrap(), 5);
        assert!(matches!(
            pipeline.enroll_path("S2", "Bob", &dir.path().join("missing.png")),
            Err(PipelineError::Image(_))
        ));
    }
}
