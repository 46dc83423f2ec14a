//! Frame containers and wire decoding.
//!
//! A raw frame arrives as one fixed-length byte buffer: 4 contiguous band
//! planes of `band_height x band_width` little-endian u16 samples. Frames
//! are owned by exactly one stage at a time and move wholesale across queue
//! boundaries; nothing in this module shares pixel data.
//!
//! Corrected pixel values use the canonical [0,1] reflectance scale.
//! Display scaling (x4095, 12-bit sensor range) happens exactly once, at
//! the consumer boundary, via [`to_display`] / [`mosaic_preview`].

use anyhow::{anyhow, Result};

use crate::Resolution;

/// Number of spectral bands sharing one raw frame.
pub const BANDS: usize = 4;

/// Full sensor range of the 12-bit camera, used only for display scaling.
pub const DISPLAY_SCALE: f32 = 4095.0;

/// One raw frame: `BANDS` contiguous band planes of u16 samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub samples: Vec<u16>,
    pub resolution: Resolution,
}

impl RawFrame {
    /// Wrap an already-decoded sample buffer. Length must match the
    /// resolution's frame shape.
    pub fn new(samples: Vec<u16>, resolution: Resolution) -> Result<Self> {
        if samples.len() != resolution.frame_samples() {
            return Err(anyhow!(
                "raw frame has {} samples, expected {} for {}x{} bands",
                samples.len(),
                resolution.frame_samples(),
                resolution.band_width,
                resolution.band_height
            ));
        }
        Ok(Self {
            samples,
            resolution,
        })
    }

    /// Immutable view of one band plane, row-major.
    pub fn band(&self, band: usize) -> &[u16] {
        let n = self.resolution.band_samples();
        &self.samples[band * n..(band + 1) * n]
    }
}

/// A frame after radiometric correction: same shape, f32 in [0,1].
#[derive(Clone, Debug, PartialEq)]
pub struct ReflectanceFrame {
    pub values: Vec<f32>,
    pub resolution: Resolution,
}

impl ReflectanceFrame {
    pub fn band(&self, band: usize) -> &[f32] {
        let n = self.resolution.band_samples();
        &self.values[band * n..(band + 1) * n]
    }
}

/// A frame after demosaicing; the unit handed to consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectedFrame {
    pub values: Vec<f32>,
    pub resolution: Resolution,
}

impl CorrectedFrame {
    pub fn band(&self, band: usize) -> &[f32] {
        let n = self.resolution.band_samples();
        &self.values[band * n..(band + 1) * n]
    }
}

/// Reinterpret one wire buffer as a raw frame.
///
/// Pure reshape: pairs of bytes become little-endian u16 samples. Any
/// length other than `resolution.frame_bytes()` is a shape error; the
/// caller drops the frame and continues.
pub fn decode_frame(bytes: &[u8], resolution: Resolution) -> Result<RawFrame> {
    let expected = resolution.frame_bytes();
    if bytes.len() != expected {
        return Err(anyhow!(
            "frame shape error: got {} bytes, expected {}",
            bytes.len(),
            expected
        ));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    RawFrame::new(samples, resolution)
}

/// Scale corrected values to the 12-bit display range, as u16.
///
/// The single place where the internal [0,1] scale leaves the pipeline.
pub fn to_display(frame: &CorrectedFrame) -> Vec<u16> {
    frame
        .values
        .iter()
        .map(|&v| (v.clamp(0.0, 1.0) * DISPLAY_SCALE) as u16)
        .collect()
}

/// Tile the 4 band planes into one `width x height` 8-bit preview image,
/// band 0 top-left, band 1 top-right, band 2 bottom-left, band 3
/// bottom-right. Row-major, one byte per pixel.
pub fn mosaic_preview(frame: &CorrectedFrame) -> Vec<u8> {
    let res = frame.resolution;
    let bw = res.band_width as usize;
    let bh = res.band_height as usize;
    let full_w = res.width as usize;
    let mut out = vec![0u8; full_w * res.height as usize];
    for band in 0..BANDS {
        let plane = frame.band(band);
        let row0 = (band / 2) * bh;
        let col0 = (band % 2) * bw;
        for r in 0..bh {
            for c in 0..bw {
                let v = (plane[r * bw + c].clamp(0.0, 1.0) * 255.0) as u8;
                out[(row0 + r) * full_w + col0 + c] = v;
            }
        }
    }
    out
}
