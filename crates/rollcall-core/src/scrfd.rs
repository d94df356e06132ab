//! SCRFD face detector via ONNX Runtime.
//!
//! The accurate backend: 3-stride anchor-free decoding with an internal IoU
//! pass. Landmark outputs are present in the model but not decoded here.

use crate::detector::{DetectorError, FaceBackend};
use crate::imgops;
use crate::types::{BoundingBox, FaceRegion};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Score and bbox per stride; keypoint tensors are ignored.
const SCRFD_MIN_OUTPUTS: usize = 6;

pub const SCRFD_BACKEND_NAME: &str = "scrfd";

/// Maps network input coordinates back to the source frame.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

pub struct ScrfdBackend {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdBackend {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_MIN_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs, got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, stride_indices })
    }

    fn preprocess(&self, frame: &[u8], width: usize, height: usize) -> (Array4<f32>, LetterboxInfo) {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
        let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;

        let resized = imgops::resize_bilinear(frame, width, height, new_w, new_h);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

        for y in 0..SCRFD_INPUT_SIZE {
            for x in 0..SCRFD_INPUT_SIZE {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w;
                let pixel = if inside {
                    resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
                } else {
                    SCRFD_MEAN
                };

                // Gray replicated to three channels
                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceBackend for ScrfdBackend {
    fn name(&self) -> &'static str {
        SCRFD_BACKEND_NAME
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(image.as_raw(), width, height);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut boxes = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            boxes.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(boxes, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|(bbox, score)| FaceRegion {
                bbox,
                detector: SCRFD_BACKEND_NAME,
                confidence: Some(score),
            })
            .collect())
    }
}

/// Output ordering by tensor name ("score_8", "bbox_16", ...), else the
/// standard positional layout [scores 8/16/32, bboxes 8/16/32, kps ...].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::debug!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<(BoundingBox, f32)> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let x1 = (anchor_x - bboxes[bbox_off] * step - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_y - bboxes[bbox_off + 1] * step - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_x + bboxes[bbox_off + 2] * step - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_y + bboxes[bbox_off + 3] * step - letterbox.pad_y) / letterbox.scale;

        detections.push((BoundingBox::new(x1, y1, x2 - x1, y2 - y1), score));
    }
    detections
}

fn nms(mut detections: Vec<(BoundingBox, f32)>, iou_threshold: f32) -> Vec<(BoundingBox, f32)> {
    detections.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.0.iou(&det.0) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
