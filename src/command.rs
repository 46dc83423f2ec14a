//! Control commands and the camera-facing channels.
//!
//! The remote camera is driven over two text channels:
//!
//! - the command channel (one long-lived connection): UTF-8 messages,
//!   `"<KEY>"` for argument-less commands and `"<KEY> = <value>"` for
//!   valued ones, keys exactly START, STOP, EXPOSURE, CLOSE;
//! - the configuration channel (one-shot at session setup): a single
//!   `--mode <w>:<h>:<depth>:<format> --resolution <KEY>` line.
//!
//! On both channels this host is the server and the camera connects in.

use anyhow::{Context, Result};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

use crate::ResolutionKey;

/// Inclusive exposure bounds accepted by the camera, in microseconds.
pub const EXPOSURE_MIN: i64 = 100;
pub const EXPOSURE_MAX: i64 = 20_000;

/// One operator command. Immutable once constructed; consumed exactly
/// once by the outbound channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Exposure(i64),
    Close,
}

impl ControlCommand {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Exposure(_) => "EXPOSURE",
            Self::Close => "CLOSE",
        }
    }

    /// Wire encoding for the command channel.
    pub fn encode(&self) -> String {
        match self {
            Self::Exposure(value) => format!("{} = {}", self.key(), value),
            _ => self.key().to_string(),
        }
    }

    /// Validate the command's argument range. State-dependent rules
    /// (no exposure changes mid-capture) live in the orchestrator.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Exposure(value) if !(EXPOSURE_MIN..=EXPOSURE_MAX).contains(value) => {
                Err(anyhow::anyhow!(
                    "exposure {} out of range ({}..={})",
                    value,
                    EXPOSURE_MIN,
                    EXPOSURE_MAX
                ))
            }
            _ => Ok(()),
        }
    }

    /// Parse an operator input line ("start", "exposure 5000", ...).
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?;
        let command = match keyword.to_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "close" => Self::Close,
            "exposure" => {
                let value: i64 = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("exposure requires a value in microseconds"))?
                    .parse()
                    .context("exposure value must be an integer")?;
                Self::Exposure(value)
            }
            other => return Err(anyhow::anyhow!("unknown command '{}'", other)),
        };
        if parts.next().is_some() {
            return Err(anyhow::anyhow!("trailing input after command"));
        }
        Ok(command)
    }
}

// ----------------------------------------------------------------------------
// Outbound command channel
// ----------------------------------------------------------------------------

/// Sender half of the outbound command channel: accepts the camera's
/// single connection, then forwards every queued command until Close is
/// sent or the queue's producers hang up.
pub struct CommandSender;

impl CommandSender {
    pub fn spawn(
        listener: TcpListener,
        commands: Receiver<ControlCommand>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            if let Err(err) = run_sender(listener, commands) {
                log::error!("command channel stopped: {:#}", err);
            }
        })
    }
}

fn run_sender(listener: TcpListener, commands: Receiver<ControlCommand>) -> Result<()> {
    log::info!("waiting for camera on the command channel...");
    let (mut stream, peer) = listener.accept().context("accept command client")?;
    log::info!("camera connected to the command channel from {}", peer);

    while let Ok(command) = commands.recv() {
        send_command(&mut stream, command)?;
        if command == ControlCommand::Close {
            break;
        }
    }
    log::info!("command channel finished");
    Ok(())
}

fn send_command(stream: &mut TcpStream, command: ControlCommand) -> Result<()> {
    stream
        .write_all(command.encode().as_bytes())
        .with_context(|| format!("send {} to camera", command.key()))?;
    stream.flush().context("flush command channel")?;
    log::debug!("sent {} to camera", command.key());
    Ok(())
}

// ----------------------------------------------------------------------------
// Camera configuration hand-shake
// ----------------------------------------------------------------------------

/// One-shot configuration server. The camera's startup script connects
/// once, reads the capture-mode line, and launches the sensor binary
/// with it.
pub struct CameraConfigServer;

impl CameraConfigServer {
    /// Sensor-mode line for a resolution preset. The mode dimensions are
    /// the sensor's readout geometry and deliberately differ from the
    /// delivered image size (empirical per-mode map).
    pub fn config_line(key: ResolutionKey) -> &'static str {
        match key {
            ResolutionKey::Low => "--mode 1332:990:10:U --resolution LOW",
            ResolutionKey::Medium => "--mode 2028:1520:12:U --resolution MEDIUM",
            ResolutionKey::High => "--mode 4056:3040:12:U --resolution HIGH",
        }
    }

    /// Accept one connection and send the configuration line. Blocks
    /// until the camera has fetched its configuration.
    pub fn serve_once(listener: &TcpListener, key: ResolutionKey) -> Result<()> {
        log::info!("waiting for camera on the configuration channel...");
        let (mut stream, peer) = listener.accept().context("accept configuration client")?;
        stream
            .write_all(Self::config_line(key).as_bytes())
            .context("send configuration line")?;
        stream.flush().context("flush configuration line")?;
        log::info!("camera at {} configured for {}", peer, key.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn encoding_matches_wire_format() {
        assert_eq!(ControlCommand::Start.encode(), "START");
        assert_eq!(ControlCommand::Stop.encode(), "STOP");
        assert_eq!(ControlCommand::Close.encode(), "CLOSE");
        assert_eq!(ControlCommand::Exposure(5000).encode(), "EXPOSURE = 5000");
    }

    #[test]
    fn exposure_bounds_validated() {
        assert!(ControlCommand::Exposure(EXPOSURE_MIN).validate().is_ok());
        assert!(ControlCommand::Exposure(EXPOSURE_MAX).validate().is_ok());
        assert!(ControlCommand::Exposure(EXPOSURE_MIN - 1).validate().is_err());
        assert!(ControlCommand::Exposure(EXPOSURE_MAX + 1).validate().is_err());
        assert!(ControlCommand::Start.validate().is_ok());
    }

    #[test]
    fn parses_operator_lines() {
        assert_eq!(ControlCommand::parse("start").unwrap(), ControlCommand::Start);
        assert_eq!(ControlCommand::parse("STOP").unwrap(), ControlCommand::Stop);
        assert_eq!(
            ControlCommand::parse("exposure 2500").unwrap(),
            ControlCommand::Exposure(2500)
        );
        assert!(ControlCommand::parse("").is_err());
        assert!(ControlCommand::parse("exposure").is_err());
        assert!(ControlCommand::parse("exposure abc").is_err());
        assert!(ControlCommand::parse("start now").is_err());
        assert!(ControlCommand::parse("pause").is_err());
    }

    #[test]
    fn config_lines_per_preset() {
        assert_eq!(
            CameraConfigServer::config_line(ResolutionKey::Low),
            "--mode 1332:990:10:U --resolution LOW"
        );
        assert_eq!(
            CameraConfigServer::config_line(ResolutionKey::Medium),
            "--mode 2028:1520:12:U --resolution MEDIUM"
        );
        assert_eq!(
            CameraConfigServer::config_line(ResolutionKey::High),
            "--mode 4056:3040:12:U --resolution HIGH"
        );
    }

    #[test]
    fn config_server_sends_line_to_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut line = String::new();
            stream.read_to_string(&mut line).unwrap();
            line
        });
        CameraConfigServer::serve_once(&listener, ResolutionKey::Medium).unwrap();
        let line = client.join().unwrap();
        assert_eq!(line, "--mode 2028:1520:12:U --resolution MEDIUM");
    }

    #[test]
    fn command_sender_forwards_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let sender = CommandSender::spawn(listener, rx);

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).unwrap();
            String::from_utf8(bytes).unwrap()
        });

        tx.send(ControlCommand::Start).unwrap();
        tx.send(ControlCommand::Exposure(1200)).unwrap();
        tx.send(ControlCommand::Close).unwrap();
        sender.join().unwrap();
        drop(tx);

        let received = client.join().unwrap();
        assert_eq!(received, "STARTEXPOSURE = 1200CLOSE");
    }
}
