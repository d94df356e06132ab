//! Face detection front-end.
//!
//! A [`Detector`] runs one or more [`FaceBackend`] passes over a frame, drops
//! candidates with implausible size or shape, and merges overlapping boxes
//! from all passes. Which backend is used is decided once, at construction,
//! from the model files present on disk.

use crate::cascade::CascadeBackend;
use crate::scrfd::ScrfdBackend;
use crate::types::FaceRegion;
use image::GrayImage;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// SCRFD model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// SeetaFace frontal cascade model file name inside the model directory.
pub const CASCADE_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no detection backend available in {0} (need {SCRFD_MODEL_FILE} or {CASCADE_MODEL_FILE})")]
    NoBackend(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection implementation.
pub trait FaceBackend: Send {
    /// Short tag recorded on every region this backend produces.
    fn name(&self) -> &'static str;

    /// Raw candidate regions, before size filtering and overlap suppression.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Which backend to load from the model directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// SCRFD when its model is present, otherwise the cascade.
    #[default]
    Auto,
    /// SCRFD only.
    Accurate,
    /// Cascade only.
    Lightweight,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "accurate" | "scrfd" => Ok(Self::Accurate),
            "lightweight" | "cascade" | "seeta" => Ok(Self::Lightweight),
            other => Err(format!("unknown detector backend '{other}'")),
        }
    }
}

/// Candidate filtering and merging thresholds.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    /// Smallest accepted box side, in pixels.
    pub min_face_size: f32,
    /// Largest accepted box side, in pixels.
    pub max_face_size: f32,
    /// Accepted width/height range.
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// A box is dropped when it covers more than this fraction of a kept,
    /// smaller-or-equal box (or is covered by a kept box by this much).
    pub overlap_threshold: f32,
    /// Upper bound on faces reported per frame.
    pub max_faces: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            min_face_size: 60.0,
            max_face_size: 500.0,
            min_aspect_ratio: 0.7,
            max_aspect_ratio: 1.4,
            overlap_threshold: 0.5,
            max_faces: 10,
        }
    }
}

impl DetectorParams {
    fn accepts(&self, region: &FaceRegion) -> bool {
        let b = &region.bbox;
        let ratio = b.aspect_ratio();
        b.width >= self.min_face_size
            && b.height >= self.min_face_size
            && b.width <= self.max_face_size
            && b.height <= self.max_face_size
            && ratio >= self.min_aspect_ratio
            && ratio <= self.max_aspect_ratio
    }
}

/// Multi-pass face detector with size filtering and overlap suppression.
pub struct Detector {
    passes: Vec<Box<dyn FaceBackend>>,
    params: DetectorParams,
}

impl Detector {
    /// Build a detector from explicit backend passes.
    pub fn with_backends(
        passes: Vec<Box<dyn FaceBackend>>,
        params: DetectorParams,
    ) -> Result<Self, DetectorError> {
        if passes.is_empty() {
            return Err(DetectorError::NoBackend("<no passes given>".into()));
        }
        Ok(Self { passes, params })
    }

    /// Pick backends by the model files present in `model_dir`.
    ///
    /// With [`BackendPreference::Auto`] every model that loads becomes a pass
    /// (SCRFD first, then the cascade) and their detections are merged.
    pub fn from_model_dir(
        model_dir: &Path,
        params: DetectorParams,
        preference: BackendPreference,
    ) -> Result<Self, DetectorError> {
        let scrfd_path = model_dir.join(SCRFD_MODEL_FILE);
        let cascade_path = model_dir.join(CASCADE_MODEL_FILE);

        let passes = assemble_passes(
            preference,
            &model_dir.display().to_string(),
            || Ok(Box::new(ScrfdBackend::load(&scrfd_path)?) as Box<dyn FaceBackend>),
            || Ok(Box::new(CascadeBackend::load(&cascade_path)?) as Box<dyn FaceBackend>),
        )?;

        let names: Vec<&str> = passes.iter().map(|p| p.name()).collect();
        tracing::info!(backends = ?names, dir = %model_dir.display(), "face detector ready");
        Self::with_backends(passes, params)
    }

    /// Names of the configured passes, in run order.
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect faces, strongest first.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let mut candidates = Vec::new();
        for pass in self.passes.iter_mut() {
            candidates.extend(pass.detect(image)?);
        }

        let raw = candidates.len();
        candidates.retain(|r| self.params.accepts(r));
        let filtered = candidates.len();

        let mut kept = suppress_overlaps(candidates, self.params.overlap_threshold);
        kept.truncate(self.params.max_faces);

        tracing::trace!(raw, filtered, kept = kept.len(), "detection pass complete");
        Ok(kept)
    }

    /// The largest detected face; equal areas go to the higher confidence.
    pub fn largest(&mut self, image: &GrayImage) -> Result<Option<FaceRegion>, DetectorError> {
        let faces = self.detect(image)?;
        Ok(faces.into_iter().reduce(|best, candidate| {
            let (a, b) = (best.bbox.area(), candidate.bbox.area());
            if b > a || (b == a && confidence_of(&candidate) > confidence_of(&best)) {
                candidate
            } else {
                best
            }
        }))
    }
}

/// Detection passes for `preference`. An explicit preference fails with its
/// loader's error; `Auto` keeps whatever loads and fails only when nothing does.
fn assemble_passes(
    preference: BackendPreference,
    model_dir: &str,
    accurate: impl FnOnce() -> Result<Box<dyn FaceBackend>, DetectorError>,
    lightweight: impl FnOnce() -> Result<Box<dyn FaceBackend>, DetectorError>,
) -> Result<Vec<Box<dyn FaceBackend>>, DetectorError> {
    match preference {
        BackendPreference::Accurate => Ok(vec![accurate()?]),
        BackendPreference::Lightweight => Ok(vec![lightweight()?]),
        BackendPreference::Auto => {
            let mut passes = Vec::new();
            for (name, loaded) in [("scrfd", accurate()), ("cascade", lightweight())] {
                match loaded {
                    Ok(backend) => passes.push(backend),
                    Err(e) => tracing::debug!(backend = name, error = %e, "detection backend unavailable"),
                }
            }
            if passes.is_empty() {
                return Err(DetectorError::NoBackend(model_dir.to_string()));
            }
            Ok(passes)
        }
    }
}

fn confidence_of(region: &FaceRegion) -> f32 {
    region.confidence.unwrap_or(0.0)
}

/// Greedy suppression across all passes.
///
/// Candidates are ranked by confidence, then area. A candidate is dropped
/// when its intersection with an already-kept box exceeds `threshold` of the
/// smaller box's area.
pub fn suppress_overlaps(mut candidates: Vec<FaceRegion>, threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| {
        confidence_of(b)
            .partial_cmp(&confidence_of(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.bbox
                    .area()
                    .partial_cmp(&a.bbox.area())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let mut kept: Vec<FaceRegion> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = kept
            .iter()
            .any(|k| k.bbox.overlap_of_smaller(&candidate.bbox) > threshold);
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    struct StubBackend {
        name: &'static str,
        boxes: Vec<(f32, f32, f32, f32, Option<f32>)>,
    }

    impl FaceBackend for StubBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(self
                .boxes
                .iter()
                .map(|&(x, y, w, h, confidence)| FaceRegion {
                    bbox: BoundingBox::new(x, y, w, h),
                    detector: self.name,
                    confidence,
                })
                .collect())
        }
    }

    fn region(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceRegion {
        FaceRegion {
            bbox: BoundingBox::new(x, y, w, h),
            detector: "stub",
            confidence: Some(conf),
        }
    }

    fn detector(passes: Vec<StubBackend>) -> Detector {
        let passes = passes
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn FaceBackend>)
            .collect();
        Detector::with_backends(passes, DetectorParams::default()).unwrap()
    }

    fn blank() -> GrayImage {
        GrayImage::new(640, 480)
    }

    #[test]
    fn test_suppression_uses_smaller_area() {
        // A small box fully inside a large one has low IoU but is still a duplicate.
        let kept = suppress_overlaps(
            vec![
                region(0.0, 0.0, 200.0, 200.0, 0.9),
                region(50.0, 50.0, 80.0, 80.0, 0.8),
                region(300.0, 300.0, 80.0, 80.0, 0.7),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, Some(0.9));
        assert_eq!(kept[1].confidence, Some(0.7));
    }

    #[test]
    fn test_suppression_keeps_light_overlap() {
        // 40% of the smaller box overlaps: both survive
        let kept = suppress_overlaps(
            vec![region(0.0, 0.0, 100.0, 100.0, 0.9), region(60.0, 0.0, 100.0, 100.0, 0.8)],
            0.5,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_suppression_empty() {
        assert!(suppress_overlaps(vec![], 0.5).is_empty());
    }

    #[test]
    fn test_filters_size_and_aspect() {
        let mut det = detector(vec![StubBackend {
            name: "stub",
            boxes: vec![
                (10.0, 10.0, 30.0, 30.0, Some(0.9)),   // too small
                (10.0, 10.0, 600.0, 600.0, Some(0.9)), // too large
                (10.0, 10.0, 150.0, 80.0, Some(0.9)),  // too wide (1.875)
                (10.0, 10.0, 70.0, 120.0, Some(0.9)),  // too tall (0.58)
                (200.0, 100.0, 90.0, 100.0, Some(0.9)), // ok (0.9)
            ],
        }]);
        let faces = det.detect(&blank()).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox::new(200.0, 100.0, 90.0, 100.0));
    }

    #[test]
    fn test_merges_across_passes() {
        let mut det = detector(vec![
            StubBackend { name: "frontal", boxes: vec![(100.0, 100.0, 100.0, 100.0, Some(0.6))] },
            StubBackend {
                name: "profile",
                boxes: vec![
                    (110.0, 105.0, 95.0, 95.0, Some(0.8)),
                    (400.0, 100.0, 100.0, 100.0, None),
                ],
            },
        ]);
        let faces = det.detect(&blank()).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].detector, "profile");
        assert_eq!(faces[0].confidence, Some(0.8));
        assert_eq!(det.backend_names(), vec!["frontal", "profile"]);
    }

    #[test]
    fn test_max_faces_cap() {
        let boxes = (0..6).map(|i| (i as f32 * 100.0, 0.0, 80.0, 80.0, Some(0.5))).collect();
        let mut det = Detector::with_backends(
            vec![Box::new(StubBackend { name: "stub", boxes })],
            DetectorParams { max_faces: 4, ..DetectorParams::default() },
        )
        .unwrap();
        assert_eq!(det.detect(&blank()).unwrap().len(), 4);
    }

    #[test]
    fn test_largest_prefers_area_then_confidence() {
        let mut det = detector(vec![StubBackend {
            name: "stub",
            boxes: vec![
                (0.0, 0.0, 80.0, 80.0, Some(0.99)),
                (200.0, 0.0, 120.0, 120.0, Some(0.5)),
                (400.0, 0.0, 120.0, 120.0, Some(0.7)),
            ],
        }]);
        let face = det.largest(&blank()).unwrap().unwrap();
        assert_eq!(face.bbox.x, 400.0);
    }

    #[test]
    fn test_largest_none_when_empty() {
        let mut det = detector(vec![StubBackend { name: "stub", boxes: vec![] }]);
        assert!(det.largest(&blank()).unwrap().is_none());
    }

    #[test]
    fn test_requires_a_pass() {
        assert!(matches!(
            Detector::with_backends(vec![], DetectorParams::default()),
            Err(DetectorError::NoBackend(_))
        ));
    }

    #[test]
    fn test_empty_model_dir_has_no_backend() {
        let dir = tempfile::tempdir().unwrap();
        let result = Detector::from_model_dir(dir.path(), DetectorParams::default(), BackendPreference::Auto);
        assert!(matches!(result, Err(DetectorError::NoBackend(_))));
    }

    fn stub_loader(
        name: &'static str,
    ) -> impl FnOnce() -> Result<Box<dyn FaceBackend>, DetectorError> {
        move || Ok(Box::new(StubBackend { name, boxes: vec![] }) as Box<dyn FaceBackend>)
    }

    fn missing_loader() -> impl FnOnce() -> Result<Box<dyn FaceBackend>, DetectorError> {
        || Err(DetectorError::ModelNotFound("missing".into()))
    }

    #[test]
    fn test_auto_uses_every_available_backend() {
        let passes =
            assemble_passes(BackendPreference::Auto, "models", stub_loader("scrfd"), stub_loader("cascade")).unwrap();
        let names: Vec<_> = passes.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["scrfd", "cascade"]);

        let passes =
            assemble_passes(BackendPreference::Auto, "models", missing_loader(), stub_loader("cascade")).unwrap();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].name(), "cascade");

        assert!(matches!(
            assemble_passes(BackendPreference::Auto, "models", missing_loader(), missing_loader()),
            Err(DetectorError::NoBackend(dir)) if dir == "models"
        ));
    }

    #[test]
    fn test_explicit_preference_loads_one_backend() {
        let passes =
            assemble_passes(BackendPreference::Lightweight, "models", stub_loader("scrfd"), stub_loader("cascade"))
                .unwrap();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].name(), "cascade");

        assert!(matches!(
            assemble_passes(BackendPreference::Accurate, "models", missing_loader(), stub_loader("cascade")),
            Err(DetectorError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_backend_preference_parse() {
        assert_eq!("auto".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!("SCRFD".parse::<BackendPreference>().unwrap(), BackendPreference::Accurate);
        assert_eq!("cascade".parse::<BackendPreference>().unwrap(), BackendPreference::Lightweight);
        assert!("haar".parse::<BackendPreference>().is_err());
    }
}
