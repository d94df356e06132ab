//! Overlay rendering for live display.

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rollcall_core::TrackedFace;
use rollcall_hw::Frame;
use std::time::Instant;

const IDENTIFIED: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN: Rgb<u8> = Rgb([220, 0, 0]);
const BAR_BACKGROUND: Rgb<u8> = Rgb([40, 40, 40]);
const BOX_THICKNESS: i32 = 2;
const BAR_HEIGHT: u32 = 6;
const BAR_GAP: i32 = 3;
const CENTER_DOT_RADIUS: i32 = 3;

/// A frame rendered to RGB with face overlays.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    /// Capture time of the underlying frame.
    pub captured_at: Instant,
    pub faces: usize,
}

impl AnnotatedFrame {
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(&self.image)?;
        Ok(buf)
    }
}

/// Draw every tracked face over `frame`.
///
/// Identified faces get a green box and a similarity bar under it; unknown
/// faces get a red box. Each box carries a dot at its centre.
pub fn render(frame: &Frame, faces: &[TrackedFace]) -> AnnotatedFrame {
    let mut image = RgbImage::from_fn(frame.width, frame.height, |x, y| {
        let v = frame.data.get((y * frame.width + x) as usize).copied().unwrap_or(0);
        Rgb([v, v, v])
    });

    for face in faces {
        let bbox = &face.region.bbox;
        let (x, y) = (bbox.x.round() as i32, bbox.y.round() as i32);
        let (w, h) = (bbox.width.round().max(1.0) as u32, bbox.height.round().max(1.0) as u32);
        let color = if face.identity.is_some() { IDENTIFIED } else { UNKNOWN };

        for offset in 0..BOX_THICKNESS {
            let rect = Rect::at(x - offset, y - offset)
                .of_size(w + (offset * 2) as u32, h + (offset * 2) as u32);
            draw_hollow_rect_mut(&mut image, rect, color);
        }

        if let Some(identity) = &face.identity {
            let bar_y = y + h as i32 + BAR_GAP;
            draw_filled_rect_mut(&mut image, Rect::at(x, bar_y).of_size(w, BAR_HEIGHT), BAR_BACKGROUND);
            let filled = (w as f32 * identity.similarity.clamp(0.0, 1.0)).round() as u32;
            if filled > 0 {
                draw_filled_rect_mut(&mut image, Rect::at(x, bar_y).of_size(filled, BAR_HEIGHT), IDENTIFIED);
            }
        }

        let (cx, cy) = bbox.center();
        draw_filled_circle_mut(&mut image, (cx.round() as i32, cy.round() as i32), CENTER_DOT_RADIUS, color);
    }

    AnnotatedFrame { image, captured_at: frame.timestamp, faces: faces.len() }
}
