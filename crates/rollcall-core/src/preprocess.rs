//! Face crop normalization.
//!
//! Turns a detected region into the canonical square [`DescriptorInput`]
//! the matcher compares, and expands enrollment crops into a small set of
//! photometric and rotational variants.

use crate::imgops;
use crate::types::{DescriptorInput, FaceRegion};
use image::GrayImage;

const DEFAULT_CANONICAL_SIZE: u32 = 100;
const DEFAULT_PADDING_RATIO: f32 = 0.15;
const CLAHE_GRID: usize = 8;
const CLAHE_CLIP_LIMIT: f32 = 4.0;

const BRIGHTEN: (f32, f32) = (1.1, 5.0);
const DIM: (f32, f32) = (0.9, -5.0);
const ROTATION_DEGREES: f32 = 5.0;

/// Contrast normalization applied after resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContrastMode {
    /// Global histogram equalization.
    #[default]
    Equalize,
    /// Tile-based CLAHE.
    Clahe,
}

#[derive(Debug, Clone)]
pub struct PreprocessParams {
    /// Side of the square output, in pixels.
    pub canonical_size: u32,
    /// Padding added on each side, as a fraction of the region's shorter side.
    pub padding_ratio: f32,
    pub contrast: ContrastMode,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            canonical_size: DEFAULT_CANONICAL_SIZE,
            padding_ratio: DEFAULT_PADDING_RATIO,
            contrast: ContrastMode::Equalize,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    params: PreprocessParams,
}

impl Preprocessor {
    pub fn new(params: PreprocessParams) -> Self {
        Self { params }
    }

    pub fn canonical_size(&self) -> u32 {
        self.params.canonical_size
    }

    /// Pad, crop, resize, normalize contrast and denoise one region.
    ///
    /// Returns `None` when the region does not intersect the image.
    pub fn normalize(&self, image: &GrayImage, region: &FaceRegion) -> Option<DescriptorInput> {
        let (width, height) = image.dimensions();
        let size = self.params.canonical_size as usize;
        if width == 0 || height == 0 || size == 0 {
            return None;
        }

        let bbox = &region.bbox;
        let pad = self.params.padding_ratio * bbox.width.min(bbox.height).max(0.0);
        let padded = bbox.padded_within(pad, width, height);

        let x0 = padded.x.floor().max(0.0) as u32;
        let y0 = padded.y.floor().max(0.0) as u32;
        let x1 = ((padded.x + padded.width).ceil() as u32).min(width);
        let y1 = ((padded.y + padded.height).ceil() as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let (crop_w, crop_h) = ((x1 - x0) as usize, (y1 - y0) as usize);
        let cropped = imgops::crop(image.as_raw(), width as usize, x0 as usize, y0 as usize, crop_w, crop_h);
        let mut face = imgops::resize_bilinear(&cropped, crop_w, crop_h, size, size);

        match self.params.contrast {
            ContrastMode::Equalize => imgops::equalize_histogram(&mut face),
            ContrastMode::Clahe => imgops::clahe(&mut face, size, size, CLAHE_GRID, CLAHE_CLIP_LIMIT),
        }

        let denoised = imgops::gaussian_blur3(&face, size, size);
        DescriptorInput::new(denoised, self.params.canonical_size)
    }

    /// The original plus brightened, dimmed and slightly rotated copies.
    pub fn variations(&self, input: &DescriptorInput) -> Vec<DescriptorInput> {
        let side = input.size as usize;
        let mut out = Vec::with_capacity(5);
        out.push(input.clone());

        for (alpha, beta) in [BRIGHTEN, DIM] {
            let mut pixels = input.pixels.clone();
            imgops::scale_offset(&mut pixels, alpha, beta);
            out.push(DescriptorInput { pixels, size: input.size });
        }

        for degrees in [ROTATION_DEGREES, -ROTATION_DEGREES] {
            let pixels = imgops::rotate_about_center(&input.pixels, side, side, degrees);
            out.push(DescriptorInput { pixels, size: input.size });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| image::Luma([((x * 3 + y * 5) % 256) as u8]))
    }

    fn region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion { bbox: BoundingBox::new(x, y, w, h), detector: "test", confidence: None }
    }

    #[test]
    fn test_normalize_canonical_size() {
        let pre = Preprocessor::default();
        let input = pre.normalize(&gradient(320, 240), &region(100.0, 60.0, 90.0, 100.0)).unwrap();
        assert_eq!(input.size, 100);
        assert_eq!(input.pixels.len(), 100 * 100);
    }

    #[test]
    fn test_normalize_deterministic() {
        let pre = Preprocessor::default();
        let img = gradient(320, 240);
        let r = region(40.0, 30.0, 120.0, 120.0);
        assert_eq!(pre.normalize(&img, &r), pre.normalize(&img, &r));
    }

    #[test]
    fn test_normalize_clamps_to_frame() {
        let pre = Preprocessor::default();
        // Region hangs off the bottom-right corner
        let input = pre.normalize(&gradient(200, 200), &region(150.0, 150.0, 80.0, 80.0));
        assert!(input.is_some());
    }

    #[test]
    fn test_normalize_outside_frame() {
        let pre = Preprocessor::default();
        assert!(pre.normalize(&gradient(200, 200), &region(300.0, 300.0, 80.0, 80.0)).is_none());
        assert!(pre.normalize(&GrayImage::new(0, 0), &region(0.0, 0.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_clahe_mode_differs() {
        let img = gradient(320, 240);
        let r = region(100.0, 60.0, 100.0, 100.0);
        let eq = Preprocessor::default().normalize(&img, &r).unwrap();
        let clahe = Preprocessor::new(PreprocessParams { contrast: ContrastMode::Clahe, ..Default::default() })
            .normalize(&img, &r)
            .unwrap();
        assert_eq!(clahe.size, eq.size);
        assert_ne!(clahe.pixels, eq.pixels);
    }

    #[test]
    fn test_variations() {
        let pre = Preprocessor::default();
        let input = DescriptorInput::new((0..100 * 100).map(|i| (i % 200) as u8).collect(), 100).unwrap();
        let vars = pre.variations(&input);
        assert_eq!(vars.len(), 5);
        assert_eq!(vars[0], input);
        assert!(vars.iter().all(|v| v.size == 100 && v.pixels.len() == 100 * 100));
        // Brightened: 100 -> 115; dimmed: 100 -> 85
        assert_eq!(vars[1].pixels[100], 115);
        assert_eq!(vars[2].pixels[100], 85);
        assert_ne!(vars[3].pixels, input.pixels);
        assert_ne!(vars[3].pixels, vars[4].pixels);
    }
}
