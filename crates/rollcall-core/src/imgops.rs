//! Grayscale image operations on row-major `u8` buffers.
//!
//! Everything here is deterministic: the same input always yields the same
//! bytes, which the matcher relies on for stable descriptors.

/// Copy a `w` x `h` window starting at (`x`, `y`). The window must lie inside the image.
pub fn crop(gray: &[u8], width: usize, x: usize, y: usize, w: usize, h: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(w * h);
    for row in y..y + h {
        let start = row * width + x;
        out.extend_from_slice(&gray[start..start + w]);
    }
    out
}

/// Resize with bilinear interpolation (pixel-center aligned).
pub fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return vec![0u8; new_w * new_h];
    }

    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// Global histogram equalization in-place. A constant image is left untouched.
pub fn equalize_histogram(gray: &mut [u8]) {
    let mut hist = [0u32; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }
    if let Some(lut) = cdf_lut(&hist) {
        for p in gray.iter_mut() {
            *p = lut[*p as usize];
        }
    }
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// The image is split into a `grid` x `grid` layout of tiles. Each tile's
/// histogram is clipped at `clip_limit` times the mean bin count and the
/// excess is spread over all bins. Per-tile lookup tables are then blended
/// bilinearly between tile centres.
pub fn clahe(gray: &mut [u8], width: usize, height: usize, grid: usize, clip_limit: f32) {
    let grid = grid.max(1);
    if width < grid || height < grid || gray.len() < width * height {
        return;
    }
    let (tile_w, tile_h) = (width / grid, height / grid);
    let clip = ((clip_limit * (tile_w * tile_h) as f32 / 256.0) as u32).max(1);

    let luts: Vec<[u8; 256]> = (0..grid * grid)
        .map(|tile| {
            let (x0, y0) = ((tile % grid) * tile_w, (tile / grid) * tile_h);
            let mut hist = [0u32; 256];
            for row in gray[y0 * width..].chunks(width).take(tile_h) {
                for &p in &row[x0..x0 + tile_w] {
                    hist[p as usize] += 1;
                }
            }
            clip_histogram(&mut hist, clip);
            cdf_lut(&hist).unwrap_or_else(|| std::array::from_fn(|level| level as u8))
        })
        .collect();

    // Nearest tile centres below and above `pos`, and the blend weight.
    let centres = |pos: usize, tile: usize| {
        let f = ((pos as f32 + 0.5) / tile as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
        let lo = f as usize;
        (lo, (lo + 1).min(grid - 1), f - lo as f32)
    };

    for y in 0..height {
        let (r0, r1, fy) = centres(y, tile_h);
        for x in 0..width {
            let (c0, c1, fx) = centres(x, tile_w);
            let idx = y * width + x;
            let level = gray[idx] as usize;
            let at = |r: usize, c: usize| luts[r * grid + c][level] as f32;

            let top = at(r0, c0) + (at(r0, c1) - at(r0, c0)) * fx;
            let bottom = at(r1, c0) + (at(r1, c1) - at(r1, c0)) * fx;
            gray[idx] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn clip_histogram(hist: &mut [u32; 256], clip: u32) {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let (share, rest) = (excess / 256, (excess % 256) as usize);
    for (level, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(level < rest);
    }
}

/// Maps each level through the normalized CDF of `hist`. `None` when the
/// histogram is empty or holds a single level.
fn cdf_lut(hist: &[u32; 256]) -> Option<[u8; 256]> {
    let total: u32 = hist.iter().sum();
    let first = hist.iter().copied().find(|&count| count > 0)?;
    if total == first {
        return None;
    }

    let span = (total - first) as f32;
    let mut lut = [0u8; 256];
    let mut running = 0u32;
    for (entry, &count) in lut.iter_mut().zip(hist.iter()) {
        running += count;
        *entry = (running.saturating_sub(first) as f32 / span * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    Some(lut)
}

/// 3x3 Gaussian blur ([1 2 1] separable), edges replicated.
pub fn gaussian_blur3(gray: &[u8], width: usize, height: usize) -> Vec<u8> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let at = |x: isize, y: isize| -> u32 {
        let cx = x.clamp(0, width as isize - 1) as usize;
        let cy = y.clamp(0, height as isize - 1) as usize;
        gray[cy * width + cx] as u32
    };

    let mut horizontal = vec![0u32; width * height];
    for y in 0..height as isize {
        for x in 0..width as isize {
            horizontal[y as usize * width + x as usize] = at(x - 1, y) + 2 * at(x, y) + at(x + 1, y);
        }
    }

    let h_at = |x: usize, y: isize| -> u32 {
        let cy = y.clamp(0, height as isize - 1) as usize;
        horizontal[cy * width + x]
    };

    let mut out = vec![0u8; width * height];
    for y in 0..height as isize {
        for x in 0..width {
            let sum = h_at(x, y - 1) + 2 * h_at(x, y) + h_at(x, y + 1);
            // Kernel weights total 16; add 8 to round to nearest.
            out[y as usize * width + x] = ((sum + 8) / 16).min(255) as u8;
        }
    }
    out
}

/// `p * alpha + beta`, saturated to 0–255.
pub fn scale_offset(gray: &mut [u8], alpha: f32, beta: f32) {
    for p in gray.iter_mut() {
        *p = (*p as f32 * alpha + beta).round().clamp(0.0, 255.0) as u8;
    }
}

/// Rotate a `width` x `height` image about its centre by `degrees`
/// (counter-clockwise), sampling bilinearly with replicated edges.
pub fn rotate_about_center(gray: &[u8], width: usize, height: usize, degrees: f32) -> Vec<u8> {
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let sample = |x: i32, y: i32| -> f32 {
        let x = x.clamp(0, width as i32 - 1) as usize;
        let y = y.clamp(0, height as i32 - 1) as usize;
        gray[y * width + x] as f32
    };

    let mut output = vec![0u8; width * height];
    for oy in 0..height {
        for ox in 0..width {
            // Inverse map: destination pixel back into the source.
            let dx = ox as f32 - cx;
            let dy = oy as f32 - cy;
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            output[oy * width + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}
