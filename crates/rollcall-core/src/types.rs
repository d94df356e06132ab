use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Width over height; 0.0 for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            0.0
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection-over-Union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Intersection as a fraction of the smaller of the two areas.
    pub fn overlap_of_smaller(&self, other: &BoundingBox) -> f32 {
        let smaller = self.area().min(other.area());
        if smaller > 0.0 {
            self.intersection_area(other) / smaller
        } else {
            0.0
        }
    }

    /// Grow by `pad` pixels on every side, then clip to a `width` x `height` frame.
    pub fn padded_within(&self, pad: f32, width: u32, height: u32) -> BoundingBox {
        let x1 = (self.x - pad).max(0.0);
        let y1 = (self.y - pad).max(0.0);
        let x2 = (self.x + self.width + pad).min(width as f32);
        let y2 = (self.y + self.height + pad).min(height as f32);
        BoundingBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }
}

/// One candidate face from a single frame.
#[derive(Debug, Clone, Serialize)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    /// Name of the backend that produced this region.
    pub detector: &'static str,
    /// Backend score, when the backend reports one.
    pub confidence: Option<f32>,
}

/// Canonical square grayscale face crop fed to the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInput {
    pub pixels: Vec<u8>,
    pub size: u32,
}

impl DescriptorInput {
    pub fn new(pixels: Vec<u8>, size: u32) -> Option<Self> {
        (pixels.len() == (size as usize) * (size as usize)).then_some(Self { pixels, size })
    }
}

/// A positive match against an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub id: String,
    pub name: String,
    /// Normalized similarity in [0, 1]; 1.0 is an identical descriptor.
    pub similarity: f32,
}

/// A detected region in one frame plus its identification, if any.
#[derive(Debug, Clone)]
pub struct Observation {
    pub region: FaceRegion,
    pub identity: Option<Identification>,
    pub timestamp: Instant,
}

impl Observation {
    pub fn similarity(&self) -> f32 {
        self.identity.as_ref().map_or(0.0, |i| i.similarity)
    }
}

/// A face observed across consecutive cycles, smoothed over time.
#[derive(Debug, Clone)]
pub struct TrackedFace {
    pub key: crate::stabilizer::PositionKey,
    /// Most recent region seen for this face.
    pub region: FaceRegion,
    /// Best identification seen so far.
    pub identity: Option<Identification>,
    pub best_similarity: f32,
    pub hits: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl TrackedFace {
    /// Display label: the identity's name or "Unknown".
    pub fn label(&self) -> &str {
        self.identity.as_ref().map_or("Unknown", |i| i.name.as_str())
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }
}
