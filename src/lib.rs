//! Multispectral capture kernel (quadspec)
//!
//! This crate implements the host side of a tethered 4-band mosaic camera:
//! it receives raw frames over TCP, calibrates them against black/white
//! references, reconstructs full-resolution band images, and hands the
//! result to display/storage consumers while a command channel drives the
//! remote camera.
//!
//! # Architecture
//!
//! Data flow (each arrow is a queue hand-off; frames move by ownership,
//! never by shared mutation):
//!
//! ```text
//! network bytes -> FrameReceiver -> decode -> RadiometricCorrector
//!               -> BandDemosaicer -> FrameSink (display/save)
//! ```
//!
//! Control flow: operator command -> `CaptureOrchestrator` -> outbound
//! command channel (remote camera) plus the internal start/stop flags
//! that gate the receive and decode stages.
//!
//! # Module Structure
//!
//! - `frame`: frame containers, wire decoding, display scaling
//! - `calibration`: reference loading, band classification, kernels
//! - `correct`: per-pixel radiometric correction
//! - `demosaic`: per-band reconstruction strategies
//! - `receiver`: image channel TCP server
//! - `command`: control commands, outbound channel, camera configuration
//! - `pipeline`: lifecycle state machine and stage threads
//! - `sink`: frame consumers (files, in-memory for tests)
//! - `config`: daemon configuration (file + env)

use anyhow::{anyhow, Result};
use serde::Deserialize;

pub mod calibration;
pub mod command;
pub mod config;
pub mod correct;
pub mod demosaic;
pub mod frame;
pub mod pipeline;
pub mod receiver;
pub mod sink;

pub use calibration::{
    BandClassification, CalibrationAnalysis, CalibrationReference, CorrectionKernel,
};
pub use command::{CameraConfigServer, CommandSender, ControlCommand};
pub use config::QuadspecConfig;
pub use correct::RadiometricCorrector;
pub use demosaic::BandDemosaicer;
pub use frame::{decode_frame, CorrectedFrame, RawFrame, ReflectanceFrame, BANDS};
pub use pipeline::{CaptureOrchestrator, PipelineHandle, PipelineState};
pub use receiver::FrameReceiver;
pub use sink::{FrameSink, MemorySink, RawFileSink};

/// Default TCP port for the raw image channel.
pub const IMAGE_PORT: u16 = 32233;
/// Default TCP port for the outbound command channel.
pub const COMMAND_PORT: u16 = 32211;
/// Default TCP port for the one-shot camera configuration hand-shake.
pub const CONFIG_PORT: u16 = 32121;

/// Per-operation timeout for network reads and queue pops, in seconds.
/// Every blocking point in the pipeline is bounded by this, so Close is
/// observed within one interval.
pub const LOOP_TIMEOUT_SECS: u64 = 2;

// -------------------- Resolution --------------------

/// Camera resolution preset keys, as accepted on the CLI and config file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionKey {
    Low,
    Medium,
    High,
}

impl ResolutionKey {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(anyhow!(
                "unknown resolution '{}'; expected LOW, MEDIUM or HIGH",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// Geometry of one capture session. Immutable once selected; every
/// component takes it at construction instead of consulting a global.
///
/// Invariant: `width = 2 * band_width`, `height = 2 * band_height`
/// (the 2x2 spectral mosaic halves each axis per band).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub band_width: u32,
    pub band_height: u32,
    pub framerate: u32,
}

impl Resolution {
    /// Look up a preset. The values mirror the camera's supported sensor
    /// modes; there is no arbitrary-geometry path.
    pub fn preset(key: ResolutionKey) -> Self {
        match key {
            ResolutionKey::Low => Self::new(1328, 990, 30),
            ResolutionKey::Medium => Self::new(2024, 1520, 15),
            ResolutionKey::High => Self::new(4056, 3040, 5),
        }
    }

    fn new(width: u32, height: u32, framerate: u32) -> Self {
        Self {
            width,
            height,
            band_width: width / 2,
            band_height: height / 2,
            framerate,
        }
    }

    /// Samples per band plane.
    pub fn band_samples(&self) -> usize {
        self.band_width as usize * self.band_height as usize
    }

    /// Samples per raw frame (4 band planes).
    pub fn frame_samples(&self) -> usize {
        self.band_samples() * BANDS
    }

    /// Exact byte length of one frame on the image wire (u16 samples).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_keep_mosaic_invariant() {
        for key in [ResolutionKey::Low, ResolutionKey::Medium, ResolutionKey::High] {
            let res = Resolution::preset(key);
            assert_eq!(res.width, 2 * res.band_width);
            assert_eq!(res.height, 2 * res.band_height);
        }
    }

    #[test]
    fn medium_preset_matches_camera_geometry() {
        let res = Resolution::preset(ResolutionKey::Medium);
        assert_eq!(res.band_width, 1012);
        assert_eq!(res.band_height, 760);
        assert_eq!(res.frame_samples(), 3_076_480);
        assert_eq!(res.frame_bytes(), 6_152_960);
    }

    #[test]
    fn resolution_key_parsing() {
        assert_eq!(
            ResolutionKey::parse("medium").unwrap(),
            ResolutionKey::Medium
        );
        assert_eq!(ResolutionKey::parse("HIGH").unwrap(), ResolutionKey::High);
        assert!(ResolutionKey::parse("ULTRA").is_err());
    }
}
