//! Per-pixel radiometric correction.
//!
//! Turns a raw frame into reflectance against the black/white references:
//!
//! ```text
//! value = (raw - black*0.8) / (white - black*0.8)
//! ```
//!
//! clamped to [0,1]. Bands with a correction kernel weight both the raw
//! and white samples by the pixel's mosaic-phase weight before the black
//! offset is subtracted, folding the flat-field correction into this
//! stage. A degenerate denominator is a defined clamp to 0, not a fault.
//!
//! Every pixel is independent; the work is a data-parallel map over a
//! flat index with no ordering assumptions.

use rayon::prelude::*;
use std::sync::Arc;

use crate::calibration::{CalibrationAnalysis, CalibrationReference, CorrectionKernel};
use crate::frame::{RawFrame, ReflectanceFrame};

/// Fraction of the black reference subtracted as the dark offset.
const BLACK_SCALE: f32 = 0.8;

/// Minimum rows per frame before the row map is dispatched in parallel.
/// Tiny test frames stay sequential.
const PARALLEL_ROW_THRESHOLD: usize = 64;

pub struct RadiometricCorrector {
    reference: Arc<CalibrationReference>,
    analysis: Arc<CalibrationAnalysis>,
}

impl RadiometricCorrector {
    pub fn new(reference: Arc<CalibrationReference>, analysis: Arc<CalibrationAnalysis>) -> Self {
        Self {
            reference,
            analysis,
        }
    }

    pub fn correct(&self, frame: &RawFrame) -> ReflectanceFrame {
        let res = frame.resolution;
        let bw = res.band_width as usize;
        let bh = res.band_height as usize;
        let mut values = vec![0.0f32; res.frame_samples()];

        let correct_row = |row_index: usize, out_row: &mut [f32]| {
            let band = row_index / bh;
            let row = row_index % bh;
            let offset = row_index * bw;
            let raw = &frame.samples[offset..offset + bw];
            let black = &self.reference.black[offset..offset + bw];
            let white = &self.reference.white[offset..offset + bw];
            let kernel = self.analysis.kernels[band].as_ref();
            for col in 0..bw {
                out_row[col] = correct_pixel(
                    raw[col],
                    white[col],
                    black[col],
                    kernel.map(|k| k.weight(row, col)),
                );
            }
        };

        let total_rows = bh * crate::frame::BANDS;
        if total_rows >= PARALLEL_ROW_THRESHOLD {
            values
                .par_chunks_mut(bw)
                .enumerate()
                .for_each(|(i, out_row)| correct_row(i, out_row));
        } else {
            for (i, out_row) in values.chunks_mut(bw).enumerate() {
                correct_row(i, out_row);
            }
        }

        ReflectanceFrame {
            values,
            resolution: res,
        }
    }
}

#[inline]
fn correct_pixel(raw: u16, white: u16, black: u16, kernel_weight: Option<f32>) -> f32 {
    let offset = black as f32 * BLACK_SCALE;
    let value = match kernel_weight {
        Some(k) => (raw as f32 * k - offset) / (white as f32 * k - offset),
        None => (raw as f32 - offset) / (white as f32 - offset),
    };
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
