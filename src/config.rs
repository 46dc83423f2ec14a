use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::{ResolutionKey, COMMAND_PORT, CONFIG_PORT, IMAGE_PORT};

const DEFAULT_BIND_IP: &str = "0.0.0.0";
const DEFAULT_OUTPUT_DIR: &str = "captures";
const DEFAULT_RESOLUTION: ResolutionKey = ResolutionKey::Medium;

#[derive(Debug, Deserialize, Default)]
struct QuadspecConfigFile {
    bind_ip: Option<String>,
    resolution: Option<ResolutionKey>,
    network: Option<NetworkConfigFile>,
    output: Option<OutputConfigFile>,
    calibration: Option<CalibrationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkConfigFile {
    image_port: Option<u16>,
    command_port: Option<u16>,
    config_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    save: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    black: Option<PathBuf>,
    white: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct QuadspecConfig {
    pub bind_ip: String,
    pub resolution: ResolutionKey,
    pub network: NetworkSettings,
    pub output: OutputSettings,
    pub calibration: CalibrationSettings,
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub image_port: u16,
    pub command_port: u16,
    pub config_port: u16,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub save: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationSettings {
    pub black: Option<PathBuf>,
    pub white: Option<PathBuf>,
}

impl QuadspecConfig {
    /// Defaults, then the JSON file named by `QUADSPEC_CONFIG` (if
    /// set), then per-field environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("QUADSPEC_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: QuadspecConfigFile) -> Result<Self> {
        let bind_ip = file
            .bind_ip
            .unwrap_or_else(|| DEFAULT_BIND_IP.to_string());
        let resolution = file.resolution.unwrap_or(DEFAULT_RESOLUTION);
        let network = NetworkSettings {
            image_port: file
                .network
                .as_ref()
                .and_then(|network| network.image_port)
                .unwrap_or(IMAGE_PORT),
            command_port: file
                .network
                .as_ref()
                .and_then(|network| network.command_port)
                .unwrap_or(COMMAND_PORT),
            config_port: file
                .network
                .and_then(|network| network.config_port)
                .unwrap_or(CONFIG_PORT),
        };
        let output = OutputSettings {
            dir: file
                .output
                .as_ref()
                .and_then(|output| output.dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            save: file.output.and_then(|output| output.save).unwrap_or(false),
        };
        let calibration = file
            .calibration
            .map(|calibration| CalibrationSettings {
                black: calibration.black,
                white: calibration.white,
            })
            .unwrap_or_default();
        Ok(Self {
            bind_ip,
            resolution,
            network,
            output,
            calibration,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(ip) = std::env::var("QUADSPEC_BIND_IP") {
            if !ip.trim().is_empty() {
                self.bind_ip = ip;
            }
        }
        if let Ok(resolution) = std::env::var("QUADSPEC_RESOLUTION") {
            if !resolution.trim().is_empty() {
                self.resolution = ResolutionKey::parse(&resolution)?;
            }
        }
        if let Ok(dir) = std::env::var("QUADSPEC_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output.dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("QUADSPEC_BLACK_REF") {
            if !path.trim().is_empty() {
                self.calibration.black = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("QUADSPEC_WHITE_REF") {
            if !path.trim().is_empty() {
                self.calibration.white = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.bind_ip
            .parse::<IpAddr>()
            .map_err(|_| anyhow!("bind_ip '{}' is not a valid IP address", self.bind_ip))?;
        let ports = [
            self.network.image_port,
            self.network.command_port,
            self.network.config_port,
        ];
        if ports.contains(&0) {
            return Err(anyhow!("ports must be non-zero"));
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(anyhow!(
                "image, command and config ports must be distinct (got {}, {}, {})",
                ports[0],
                ports[1],
                ports[2]
            ));
        }
        // A reference pair is all-or-nothing; one file alone cannot
        // calibrate anything.
        if self.calibration.black.is_some() != self.calibration.white.is_some() {
            return Err(anyhow!(
                "calibration needs both a black and a white reference"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<QuadspecConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
