//! Per-band reconstruction of the 2x2 spectral mosaic.
//!
//! Each band carries a "real" signal only on the mosaic phases its filter
//! responds to; the remaining cells are reconstructed from same-parity
//! neighbors. The strategy per band comes from the calibration analysis:
//!
//! - `AllResponsive`: passthrough (the flat-field kernel was already
//!   folded in by the corrector).
//! - `RedDominant` / `BlueDominant`: one parameterized algorithm with the
//!   dominant phase at (even,even) and (odd,odd) respectively. Dominant
//!   cells copy through unchanged; one-axis-off cells average their two
//!   axis neighbors; both-axes-off cells average their four diagonal
//!   neighbors. Border cells with an incomplete neighbor set copy a
//!   single neighbor instead of averaging a partial set.
//! - `GreenDominant`: no reference calibration produces this pattern;
//!   treated as passthrough (flagged at construction).
//!
//! Bands are independent of each other and rows are independent within a
//! band, so the whole stage is a parallel map with no shared mutable
//! state. Off-by-one errors here corrupt a visible stripe pattern rather
//! than crash, which is why the border rules are pinned by tests.

use rayon::prelude::*;
use std::sync::Arc;

use crate::calibration::{BandClassification, CalibrationAnalysis};
use crate::frame::{CorrectedFrame, ReflectanceFrame, BANDS};

/// Minimum band rows before the row map is dispatched in parallel.
const PARALLEL_ROW_THRESHOLD: usize = 64;

pub struct BandDemosaicer {
    analysis: Arc<CalibrationAnalysis>,
}

impl BandDemosaicer {
    pub fn new(analysis: Arc<CalibrationAnalysis>) -> Self {
        for (band, classification) in analysis.classifications.iter().enumerate() {
            if *classification == BandClassification::GreenDominant {
                log::warn!(
                    "band {}: green-dominant pattern has no defined reconstruction; \
                     falling back to passthrough",
                    band
                );
            }
        }
        Self { analysis }
    }

    pub fn demosaic(&self, frame: &ReflectanceFrame) -> CorrectedFrame {
        let res = frame.resolution;
        let n = res.band_samples();
        let w = res.band_width as usize;
        let h = res.band_height as usize;
        let mut values = vec![0.0f32; res.frame_samples()];

        values
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(band, out_plane)| {
                let input = frame.band(band);
                match self.analysis.classifications[band] {
                    BandClassification::AllResponsive | BandClassification::GreenDominant => {
                        out_plane.copy_from_slice(input);
                    }
                    BandClassification::RedDominant => {
                        interpolate_dominant(input, out_plane, h, w, 0);
                    }
                    BandClassification::BlueDominant => {
                        interpolate_dominant(input, out_plane, h, w, 1);
                    }
                }
            });

        debug_assert_eq!(values.len(), n * BANDS);
        CorrectedFrame {
            values,
            resolution: res,
        }
    }
}

/// Reconstruct one band whose dominant mosaic phase is
/// `(parity, parity)`. Red uses parity 0, blue parity 1; the two are the
/// same algorithm with transposed row-parity roles (red's last-row
/// fallback mirrors blue's first-row fallback).
fn interpolate_dominant(input: &[f32], out: &mut [f32], h: usize, w: usize, parity: usize) {
    let process_row = |r: usize, out_row: &mut [f32]| {
        let row_on = r % 2 == parity;
        for c in 0..w {
            let col_on = c % 2 == parity;
            out_row[c] = match (row_on, col_on) {
                (true, true) => input[r * w + c],
                (true, false) => axis_mean(input, r * w, c, w, 1),
                (false, true) => axis_mean(input, c, r, h, w),
                (false, false) => diagonal_mean(input, r, c, h, w),
            };
        }
    };

    if h >= PARALLEL_ROW_THRESHOLD {
        out.par_chunks_mut(w)
            .enumerate()
            .for_each(|(r, out_row)| process_row(r, out_row));
    } else {
        for (r, out_row) in out.chunks_mut(w).enumerate() {
            process_row(r, out_row);
        }
    }
}

/// Mean of the two same-parity neighbors along one axis, or a single
/// copy when the cell sits on the first/last line of that axis.
///
/// `base` is the flat offset of the line's origin, `i` the position along
/// the axis, `len` the axis length and `stride` the flat step per axis
/// unit (1 for horizontal, band width for vertical).
#[inline]
fn axis_mean(input: &[f32], base: usize, i: usize, len: usize, stride: usize) -> f32 {
    match (i > 0, i + 1 < len) {
        (true, true) => (input[base + (i - 1) * stride] + input[base + (i + 1) * stride]) / 2.0,
        (true, false) => input[base + (i - 1) * stride],
        (false, true) => input[base + (i + 1) * stride],
        // len >= 2 everywhere in this pipeline; unreachable for real frames.
        (false, false) => input[base + i * stride],
    }
}

/// Mean of the four diagonal same-parity neighbors, or a deterministic
/// single-neighbor copy at borders (preference: up-left, up-right,
/// down-left, down-right).
#[inline]
fn diagonal_mean(input: &[f32], r: usize, c: usize, h: usize, w: usize) -> f32 {
    let up = r > 0;
    let down = r + 1 < h;
    let left = c > 0;
    let right = c + 1 < w;

    if up && down && left && right {
        return (input[(r - 1) * w + c - 1]
            + input[(r - 1) * w + c + 1]
            + input[(r + 1) * w + c - 1]
            + input[(r + 1) * w + c + 1])
            / 4.0;
    }
    if up && left {
        input[(r - 1) * w + c - 1]
    } else if up && right {
        input[(r - 1) * w + c + 1]
    } else if down && left {
        input[(r + 1) * w + c - 1]
    } else {
        // down && right; h, w >= 2 guarantees one diagonal exists.
        input[(r + 1) * w + c + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn band_res(w: u32, h: u32) -> Resolution {
        Resolution {
            width: w * 2,
            height: h * 2,
            band_width: w,
            band_height: h,
            framerate: 1,
        }
    }

    /// Grid with value r*10 + c, easy to eyeball in failures.
    fn grid(h: usize, w: usize) -> Vec<f32> {
        (0..h * w).map(|i| ((i / w) * 10 + i % w) as f32).collect()
    }

    fn run(input: &[f32], h: usize, w: usize, parity: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; h * w];
        interpolate_dominant(input, &mut out, h, w, parity);
        out
    }

    #[test]
    fn red_dominant_parity_cells_copy_unchanged() {
        let (h, w) = (4, 4);
        let input = grid(h, w);
        let out = run(&input, h, w, 0);
        for r in (0..h).step_by(2) {
            for c in (0..w).step_by(2) {
                assert_eq!(out[r * w + c], input[r * w + c], "({r},{c})");
            }
        }
    }

    #[test]
    fn red_interior_interpolation() {
        let (h, w) = (4, 4);
        let input = grid(h, w);
        let out = run(&input, h, w, 0);
        // Horizontal: (0,1) = mean of (0,0) and (0,2).
        assert_eq!(out[1], (0.0 + 2.0) / 2.0);
        // Vertical: (1,0) = mean of (0,0) and (2,0).
        assert_eq!(out[w], (0.0 + 20.0) / 2.0);
        // Diagonal: (1,1) = mean of the four even-parity corners.
        assert_eq!(out[w + 1], (0.0 + 2.0 + 20.0 + 22.0) / 4.0);
    }

    #[test]
    fn red_border_fallbacks_copy_single_neighbor() {
        let (h, w) = (4, 4);
        let input = grid(h, w);
        let out = run(&input, h, w, 0);
        // Last column, on-parity row: copy left on-parity neighbor.
        assert_eq!(out[3], input[2]); // (0,3) <- (0,2)
        // Last row, on-parity column: copy the row above's neighbor.
        assert_eq!(out[3 * w], input[2 * w]); // (3,0) <- (2,0)
        // Last row+column corner: up-left diagonal copy.
        assert_eq!(out[3 * w + 3], input[2 * w + 2]);
        // Off-axis diagonal against the right edge: up-left preferred.
        assert_eq!(out[w + 3], input[2]); // (1,3) <- (0,2)
    }

    #[test]
    fn blue_mirrors_red_with_odd_parity() {
        let (h, w) = (4, 4);
        let input = grid(h, w);
        let out = run(&input, h, w, 1);
        // Dominant cells: odd/odd.
        assert_eq!(out[w + 1], input[w + 1]);
        assert_eq!(out[3 * w + 3], input[3 * w + 3]);
        // First row, odd column: vertical fallback copies from below.
        assert_eq!(out[1], input[w + 1]); // (0,1) <- (1,1)
        // First column, odd row: horizontal fallback copies from the right.
        assert_eq!(out[w], input[w + 1]); // (1,0) <- (1,1)
        // Top-left corner, both axes off: only down-right exists.
        assert_eq!(out[0], input[w + 1]); // (0,0) <- (1,1)
        // Interior diagonal: (2,2) = mean of odd-parity corners.
        assert_eq!(
            out[2 * w + 2],
            (input[w + 1] + input[w + 3] + input[3 * w + 1] + input[3 * w + 3]) / 4.0
        );
    }

    #[test]
    fn border_rules_hold_for_minimal_band() {
        let (h, w) = (2, 2);
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let red = run(&input, h, w, 0);
        // Dominant (0,0); everything else collapses to a single copy.
        assert_eq!(red, vec![1.0, 1.0, 1.0, 1.0]);
        let blue = run(&input, h, w, 1);
        assert_eq!(blue, vec![4.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn border_determinism_across_sizes() {
        // The fallback rules are total for every H, W >= 2, odd or even.
        for (h, w) in [(2, 3), (3, 2), (3, 3), (5, 4), (4, 5), (7, 7)] {
            let input = grid(h, w);
            for parity in [0, 1] {
                let out = run(&input, h, w, parity);
                assert!(out.iter().all(|v| v.is_finite()));
                // Dominant cells always copy through.
                for r in 0..h {
                    for c in 0..w {
                        if r % 2 == parity && c % 2 == parity {
                            assert_eq!(out[r * w + c], input[r * w + c]);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn all_responsive_band_passes_through() {
        use crate::calibration::CalibrationAnalysis;
        let res = band_res(4, 4);
        let analysis = CalibrationAnalysis {
            classifications: [BandClassification::AllResponsive; BANDS],
            kernels: [None; BANDS],
        };
        let demosaicer = BandDemosaicer::new(Arc::new(analysis));
        let values: Vec<f32> = (0..res.frame_samples()).map(|i| i as f32).collect();
        let frame = ReflectanceFrame {
            values: values.clone(),
            resolution: res,
        };
        let out = demosaicer.demosaic(&frame);
        assert_eq!(out.values, values);
    }

    #[test]
    fn mixed_bands_are_reconstructed_independently() {
        use crate::calibration::CalibrationAnalysis;
        let res = band_res(4, 4);
        let analysis = CalibrationAnalysis {
            classifications: [
                BandClassification::RedDominant,
                BandClassification::AllResponsive,
                BandClassification::BlueDominant,
                BandClassification::AllResponsive,
            ],
            kernels: [None; BANDS],
        };
        let demosaicer = BandDemosaicer::new(Arc::new(analysis));
        let n = res.band_samples();
        let mut values = vec![0.0f32; res.frame_samples()];
        for (i, v) in values.iter_mut().enumerate() {
            *v = (i % n) as f32;
        }
        let frame = ReflectanceFrame {
            values: values.clone(),
            resolution: res,
        };
        let out = demosaicer.demosaic(&frame);
        // Passthrough bands unchanged.
        assert_eq!(out.band(1), frame.band(1));
        assert_eq!(out.band(3), frame.band(3));
        // Red band keeps its dominant cells.
        assert_eq!(out.band(0)[0], frame.band(0)[0]);
        // Blue band keeps its dominant cells.
        assert_eq!(out.band(2)[5], frame.band(2)[5]);
    }
}
