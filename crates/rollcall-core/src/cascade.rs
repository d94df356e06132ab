//! SeetaFace frontal cascade backend via `rustface`.
//!
//! The lightweight option: no ONNX runtime needed, a single small model file.

use crate::detector::{DetectorError, FaceBackend};
use crate::types::{BoundingBox, FaceRegion};
use image::GrayImage;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const CASCADE_MIN_FACE_SIZE: u32 = 40;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

pub const CASCADE_BACKEND_NAME: &str = "cascade";

pub struct CascadeBackend {
    model: rustface::Model,
}

impl CascadeBackend {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let file = File::open(model_path)
            .map_err(|e| DetectorError::ModelNotFound(format!("{}: {e}", model_path.display())))?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| {
            DetectorError::InferenceFailed(format!("invalid cascade model {}: {e}", model_path.display()))
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");
        Ok(Self { model })
    }
}

impl FaceBackend for CascadeBackend {
    fn name(&self) -> &'static str {
        CASCADE_BACKEND_NAME
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        // The rustface detector keeps per-run scratch state, so build one per call.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let data = rustface::ImageData::new(image.as_raw(), image.width(), image.height());
        let faces = detector.detect(&data);

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceRegion {
                    bbox: BoundingBox::new(
                        bbox.x() as f32,
                        bbox.y() as f32,
                        bbox.width() as f32,
                        bbox.height() as f32,
                    ),
                    detector: CASCADE_BACKEND_NAME,
                    confidence: Some(face.score() as f32),
                }
            })
            .collect())
    }
}
