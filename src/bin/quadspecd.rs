//! quadspecd - multispectral capture daemon
//!
//! This daemon:
//! 1. Loads black/white calibration references and classifies each band
//! 2. Serves the camera's capture-mode configuration
//! 3. Receives raw frames on the image channel and runs the
//!    correct/demosaic pipeline
//! 4. Drives the camera over the outbound command channel
//! 5. Takes START/STOP/EXPOSURE/CLOSE from stdin (Ctrl-C closes)

use anyhow::{Context, Result};
use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use quadspec::{
    calibration::{CalibrationAnalysis, CalibrationReference},
    CameraConfigServer, CaptureOrchestrator, CommandSender, ControlCommand, QuadspecConfig,
    RawFileSink, Resolution, ResolutionKey,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multispectral camera capture daemon")]
struct Args {
    /// Address to bind the camera-facing servers on.
    #[arg(long, env = "QUADSPEC_BIND_IP")]
    ip: Option<String>,

    /// Resolution preset: LOW, MEDIUM or HIGH.
    #[arg(long, env = "QUADSPEC_RESOLUTION")]
    resolution: Option<String>,

    /// Persist corrected frames to disk.
    #[arg(long)]
    save: bool,

    /// Folder for capture sessions.
    #[arg(long, env = "QUADSPEC_OUTPUT_DIR")]
    output_folder: Option<PathBuf>,

    /// Black (dark) reference frame for the selected resolution.
    #[arg(long, env = "QUADSPEC_BLACK_REF")]
    black_calibration: Option<PathBuf>,

    /// White (flat-field) reference frame for the selected resolution.
    #[arg(long, env = "QUADSPEC_WHITE_REF")]
    white_calibration: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = QuadspecConfig::load()?;
    if let Some(ip) = args.ip {
        config.bind_ip = ip;
    }
    if let Some(resolution) = args.resolution.as_deref() {
        config.resolution = ResolutionKey::parse(resolution)?;
    }
    if args.save {
        config.output.save = true;
    }
    if let Some(dir) = args.output_folder {
        config.output.dir = dir;
    }
    if let Some(path) = args.black_calibration {
        config.calibration.black = Some(path);
    }
    if let Some(path) = args.white_calibration {
        config.calibration.white = Some(path);
    }

    let resolution = Resolution::preset(config.resolution);
    log::info!(
        "quadspecd {} starting: {} ({}x{} @ {} fps)",
        env!("CARGO_PKG_VERSION"),
        config.resolution.as_str(),
        resolution.width,
        resolution.height,
        resolution.framerate
    );

    // Calibration is mandatory and checked before any socket is opened;
    // a miscalibrated rig must not record anything.
    let (black, white) = match (&config.calibration.black, &config.calibration.white) {
        (Some(black), Some(white)) => (black.clone(), white.clone()),
        _ => anyhow::bail!(
            "calibration references are required (--black-calibration / --white-calibration)"
        ),
    };
    let reference = Arc::new(CalibrationReference::load(&black, &white, resolution)?);
    let analysis = Arc::new(CalibrationAnalysis::analyze(&reference)?);
    for (band, classification) in analysis.classifications.iter().enumerate() {
        log::info!("band {}: {:?}", band, classification);
    }

    let image_listener = bind(&config.bind_ip, config.network.image_port, "image")?;
    let command_listener = bind(&config.bind_ip, config.network.command_port, "command")?;
    let config_listener = bind(&config.bind_ip, config.network.config_port, "configuration")?;

    // The camera's startup script re-fetches its configuration on every
    // boot, so keep serving it for the daemon's lifetime.
    let preset = config.resolution;
    std::thread::spawn(move || loop {
        if let Err(err) = CameraConfigServer::serve_once(&config_listener, preset) {
            log::error!("configuration hand-shake failed: {:#}", err);
        }
    });

    let (outbound_tx, outbound_rx) = mpsc::channel();
    let sender = CommandSender::spawn(command_listener, outbound_rx);

    let sink = RawFileSink::new(config.output.dir.clone());
    let handle = CaptureOrchestrator {
        resolution,
        reference,
        analysis,
        image_listener,
        outbound: outbound_tx,
        sink: Box::new(sink),
        save: config.output.save,
    }
    .spawn()?;

    let (op_tx, op_rx) = mpsc::channel();
    let ctrlc_tx = op_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(ControlCommand::Close);
    })
    .expect("error setting Ctrl-C handler");
    std::thread::spawn(move || read_operator_commands(op_tx));

    log::info!("ready; commands: start, stop, exposure <us>, close (Ctrl-C closes)");
    while let Ok(command) = op_rx.recv() {
        let closing = command == ControlCommand::Close;
        handle.send(command)?;
        if closing {
            break;
        }
    }

    log::info!("shutting down...");
    handle.close()?;
    // The command channel thread exits after delivering CLOSE; if the
    // camera never connected it is still parked in accept, and process
    // exit reaps it.
    drop(sender);
    log::info!("quadspecd stopped");
    Ok(())
}

fn bind(ip: &str, port: u16, name: &str) -> Result<TcpListener> {
    let addr = format!("{}:{}", ip, port);
    let listener =
        TcpListener::bind(&addr).with_context(|| format!("bind {} channel on {}", name, addr))?;
    log::info!("{} channel listening on {}", name, addr);
    Ok(listener)
}

fn read_operator_commands(op_tx: mpsc::Sender<ControlCommand>) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match ControlCommand::parse(trimmed) {
                    Ok(command) => {
                        let closing = command == ControlCommand::Close;
                        if op_tx.send(command).is_err() || closing {
                            return;
                        }
                    }
                    Err(err) => log::error!("{:#}", err),
                }
            }
            Err(err) => {
                log::error!("stdin read failed: {}", err);
                return;
            }
        }
    }
}
