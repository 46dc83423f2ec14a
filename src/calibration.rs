//! Calibration references and per-band filter analysis.
//!
//! The camera ships two reference captures: a dark-field (black) and a
//! flat-field (white) frame. Both are loaded fully before any frame
//! processing begins and stay immutable for the process lifetime.
//!
//! From the white reference the analyzer derives, once per load, each
//! band's dominant-filter classification and, for bands that respond on
//! every mosaic phase, a 2x2 flat-field correction kernel. An
//! unrecognized response pattern is a calibration error and aborts
//! startup; guessing a demosaicing strategy silently corrupts every
//! frame afterwards.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::frame::BANDS;
use crate::Resolution;

/// Relative response threshold that marks a mosaic phase as "strong".
const RESPONSE_THRESHOLD: f32 = 0.9;

/// Black and white reference frames, RawFrame-shaped u16 planes.
pub struct CalibrationReference {
    pub black: Vec<u16>,
    pub white: Vec<u16>,
    pub resolution: Resolution,
}

impl CalibrationReference {
    /// Load both references from raw binary files of little-endian u16
    /// samples. Fails fast on short or oversized files.
    pub fn load(black_path: &Path, white_path: &Path, resolution: Resolution) -> Result<Self> {
        let black = read_reference(black_path, resolution)
            .with_context(|| format!("black calibration {}", black_path.display()))?;
        let white = read_reference(white_path, resolution)
            .with_context(|| format!("white calibration {}", white_path.display()))?;
        Ok(Self {
            black,
            white,
            resolution,
        })
    }

    /// Build a reference from in-memory sample buffers (tests, embedded
    /// fixtures). Lengths must match the frame shape.
    pub fn from_samples(black: Vec<u16>, white: Vec<u16>, resolution: Resolution) -> Result<Self> {
        let expected = resolution.frame_samples();
        if black.len() != expected || white.len() != expected {
            return Err(anyhow!(
                "calibration reference has {}/{} samples, expected {}",
                black.len(),
                white.len(),
                expected
            ));
        }
        Ok(Self {
            black,
            white,
            resolution,
        })
    }

    fn white_band(&self, band: usize) -> &[u16] {
        let n = self.resolution.band_samples();
        &self.white[band * n..(band + 1) * n]
    }
}

fn read_reference(path: &Path, resolution: Resolution) -> Result<Vec<u16>> {
    let bytes = std::fs::read(path)?;
    let expected = resolution.frame_bytes();
    if bytes.len() != expected {
        return Err(anyhow!(
            "reference file is {} bytes, expected {}",
            bytes.len(),
            expected
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Dominant-filter classification of one band, derived from the white
/// reference's response pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandClassification {
    RedDominant,
    GreenDominant,
    BlueDominant,
    AllResponsive,
}

/// Per-phase flat-field weights for an AllResponsive band.
///
/// Indexed by mosaic phase: `weights[row parity][col parity]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrectionKernel {
    pub weights: [[f32; 2]; 2],
}

impl CorrectionKernel {
    #[inline]
    pub fn weight(&self, row: usize, col: usize) -> f32 {
        self.weights[row & 1][col & 1]
    }
}

/// Result of analyzing the white reference: one classification per band,
/// plus a kernel for each AllResponsive band. Computed once at startup
/// and shared read-only with every subsequent frame.
#[derive(Clone, Debug)]
pub struct CalibrationAnalysis {
    pub classifications: [BandClassification; BANDS],
    pub kernels: [Option<CorrectionKernel>; BANDS],
}

impl CalibrationAnalysis {
    pub fn analyze(reference: &CalibrationReference) -> Result<Self> {
        let mut classifications = [BandClassification::AllResponsive; BANDS];
        let mut kernels: [Option<CorrectionKernel>; BANDS] = [None; BANDS];

        for band in 0..BANDS {
            let (classification, kernel) = analyze_band(reference, band)
                .with_context(|| format!("band {} classification", band))?;
            log::debug!("band {} classified as {:?}", band, classification);
            classifications[band] = classification;
            kernels[band] = kernel;
        }

        Ok(Self {
            classifications,
            kernels,
        })
    }
}

/// Classify one band from the 2x2 patch centered in its white plane.
///
/// The patch covers all four mosaic phases regardless of where it lands;
/// cells are mapped to absolute phase so the pattern is independent of
/// the patch origin's parity.
fn analyze_band(
    reference: &CalibrationReference,
    band: usize,
) -> Result<(BandClassification, Option<CorrectionKernel>)> {
    let res = reference.resolution;
    let bw = res.band_width as usize;
    let bh = res.band_height as usize;
    if bh < 2 || bw < 2 {
        return Err(anyhow!(
            "band plane {}x{} is too small to hold a classification patch",
            bw,
            bh
        ));
    }
    // Clamp the centered origin so the 2x2 patch stays in-plane for the
    // smallest valid geometries (H or W of 2).
    let row0 = (bh / 2).min(bh - 2);
    let col0 = (bw / 2).min(bw - 2);
    let plane = reference.white_band(band);

    // Patch values and the white sample per absolute phase.
    let mut phase_value = [[0.0f32; 2]; 2];
    let mut patch_max = 0.0f32;
    for dr in 0..2 {
        for dc in 0..2 {
            let v = plane[(row0 + dr) * bw + (col0 + dc)] as f32;
            phase_value[(row0 + dr) & 1][(col0 + dc) & 1] = v;
            patch_max = patch_max.max(v);
        }
    }
    if patch_max <= 0.0 {
        return Err(anyhow!("white reference patch is all zero"));
    }

    let mut responsive = [[false; 2]; 2];
    for (pr, row) in phase_value.iter().enumerate() {
        for (pc, &v) in row.iter().enumerate() {
            responsive[pr][pc] = v / patch_max > RESPONSE_THRESHOLD;
        }
    }

    let classification = match responsive {
        [[true, true], [true, true]] => BandClassification::AllResponsive,
        [[true, false], [false, false]] => BandClassification::RedDominant,
        [[false, true], [false, false]] => BandClassification::GreenDominant,
        [[false, false], [false, true]] => BandClassification::BlueDominant,
        other => {
            return Err(anyhow!(
                "unrecognized filter response pattern {:?}; calibration data is unusable",
                other
            ))
        }
    };

    let kernel = match classification {
        BandClassification::AllResponsive => Some(CorrectionKernel {
            weights: [
                [
                    patch_max / phase_value[0][0],
                    patch_max / phase_value[0][1],
                ],
                [
                    patch_max / phase_value[1][0],
                    patch_max / phase_value[1][1],
                ],
            ],
        }),
        _ => None,
    };

    Ok((classification, kernel))
}
