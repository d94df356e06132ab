//! Local binary pattern histograms.
//!
//! Each descriptor is an 8x8 grid of 256-bin LBP histograms, every cell
//! normalized to sum to one. Two descriptors are compared with the
//! alternative chi-square distance averaged over cells, which lies in [0, 4].

use crate::types::DescriptorInput;
use std::sync::Arc;

const LBP_BINS: usize = 256;
const DEFAULT_GRID: usize = 8;
/// Mean per-cell distance that maps to zero similarity.
const DEFAULT_DISTANCE_CEILING: f32 = 1.5625;

/// Per-sample histogram, shared between the gallery and compiled models.
pub type Histogram = Arc<[f32]>;

#[derive(Debug, Clone, PartialEq)]
pub struct LbphParams {
    pub grid_x: usize,
    pub grid_y: usize,
    pub distance_ceiling: f32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
            distance_ceiling: DEFAULT_DISTANCE_CEILING,
        }
    }
}

impl LbphParams {
    pub fn cells(&self) -> usize {
        self.grid_x * self.grid_y
    }

    /// Map a distance onto [0, 1], 1.0 being identical.
    pub fn similarity(&self, distance: f32) -> f32 {
        if self.distance_ceiling <= 0.0 {
            return if distance <= 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - distance / self.distance_ceiling).clamp(0.0, 1.0)
    }
}

/// 8-neighbour, radius-1 LBP codes for the interior pixels.
///
/// Bits run clockwise from the top-left neighbour, most significant first;
/// a bit is set when the neighbour is at least as bright as the centre.
fn lbp_codes(pixels: &[u8], side: usize) -> Vec<u8> {
    if side < 3 {
        return Vec::new();
    }
    const OFFSETS: [(isize, isize); 8] = [(-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0)];

    let inner = side - 2;
    let mut codes = Vec::with_capacity(inner * inner);
    for y in 1..side - 1 {
        for x in 1..side - 1 {
            let center = pixels[y * side + x];
            let mut code = 0u8;
            for (dx, dy) in OFFSETS {
                let nx = (x as isize + dx) as usize;
                let ny = (y as isize + dy) as usize;
                code = (code << 1) | u8::from(pixels[ny * side + nx] >= center);
            }
            codes.push(code);
        }
    }
    codes
}

/// Compute the spatial LBP histogram of a canonical face.
pub fn histogram(input: &DescriptorInput, params: &LbphParams) -> Histogram {
    let side = input.size as usize;
    let codes = lbp_codes(&input.pixels, side);
    let inner = side.saturating_sub(2);

    let mut hist = vec![0.0f32; params.cells() * LBP_BINS];
    if inner == 0 {
        return hist.into();
    }

    for cy in 0..params.grid_y {
        let y_start = cy * inner / params.grid_y;
        let y_end = (cy + 1) * inner / params.grid_y;
        for cx in 0..params.grid_x {
            let x_start = cx * inner / params.grid_x;
            let x_end = (cx + 1) * inner / params.grid_x;

            let count = (y_end - y_start) * (x_end - x_start);
            if count == 0 {
                continue;
            }

            let cell = &mut hist[(cy * params.grid_x + cx) * LBP_BINS..][..LBP_BINS];
            for y in y_start..y_end {
                for &code in &codes[y * inner + x_start..y * inner + x_end] {
                    cell[code as usize] += 1.0;
                }
            }
            let norm = 1.0 / count as f32;
            cell.iter_mut().for_each(|v| *v *= norm);
        }
    }

    hist.into()
}

/// Mean per-cell alternative chi-square distance, `sum 2(a-b)^2 / (a+b)`.
pub fn distance(a: &[f32], b: &[f32], cells: usize) -> f32 {
    let total: f32 = a
        .iter()
        .zip(b)
        .filter(|(x, y)| *x + *y > 0.0)
        .map(|(x, y)| {
            let diff = x - y;
            2.0 * diff * diff / (x + y)
        })
        .sum();
    total / cells.max(1) as f32
}

#[derive(Debug, Clone)]
struct ModelEntry {
    identity: usize,
    histogram: Histogram,
}

/// Closest sample found by [`LbphModel::nearest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub id: String,
    pub name: String,
    pub distance: f32,
    pub similarity: f32,
}

/// Compiled nearest-neighbour model over every enrolled sample.
#[derive(Debug)]
pub struct LbphModel {
    params: LbphParams,
    identities: Vec<(String, String)>,
    entries: Vec<ModelEntry>,
}

impl LbphModel {
    /// Build from `(id, name, sample histograms)` triples.
    pub fn build<'a, I>(params: LbphParams, templates: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, Vec<Histogram>)>,
    {
        let mut identities = Vec::new();
        let mut entries = Vec::new();
        for (id, name, histograms) in templates {
            let identity = identities.len();
            identities.push((id.to_string(), name.to_string()));
            entries.extend(histograms.into_iter().map(|histogram| ModelEntry { identity, histogram }));
        }
        Self { params, identities, entries }
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn sample_count(&self) -> usize {
        self.entries.len()
    }

    /// Nearest sample over all identities; ties keep the first enrolled.
    pub fn nearest(&self, input: &DescriptorInput) -> Option<Nearest> {
        let probe = histogram(input, &self.params);
        let cells = self.params.cells();

        let (entry, best) = self
            .entries
            .iter()
            .map(|e| (e, distance(&probe, &e.histogram, cells)))
            .fold(None, |acc: Option<(&ModelEntry, f32)>, (e, d)| match acc {
                Some((_, best)) if best <= d => acc,
                _ => Some((e, d)),
            })?;

        let (id, name) = &self.identities[entry.identity];
        Some(Nearest {
            id: id.clone(),
            name: name.clone(),
            distance: best,
            similarity: self.params.similarity(best),
        })
    }
}
