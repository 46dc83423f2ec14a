//! Frame persistence.
//!
//! Corrected frames travel through the pipeline in canonical reflectance
//! units in `[0, 1]`. The sink is the single place where frames are
//! scaled to 12-bit display range before they leave the process.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::CorrectedFrame;

/// Destination for corrected frames. One session per capture run;
/// frames within a session arrive in capture order.
pub trait FrameSink: Send {
    /// Called on capture start, before the session's first frame.
    fn begin_session(&mut self) -> Result<()>;

    /// Persist one frame. An error drops the frame; the pipeline keeps
    /// running.
    fn accept(&mut self, frame: &CorrectedFrame) -> Result<()>;
}

/// Writes each session into its own epoch-named folder, one raw file
/// per frame: display-scaled u16 samples, little-endian, band planes
/// in band order.
pub struct RawFileSink {
    root: PathBuf,
    session: Option<PathBuf>,
    frame_index: u64,
}

impl RawFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: None,
            frame_index: 0,
        }
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session.as_deref()
    }
}

impl FrameSink for RawFileSink {
    fn begin_session(&mut self) -> Result<()> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_secs();
        let dir = self.root.join(format!("capture_{}", epoch));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create session folder {}", dir.display()))?;
        log::info!("capture session folder: {}", dir.display());
        self.session = Some(dir);
        self.frame_index = 0;
        Ok(())
    }

    fn accept(&mut self, frame: &CorrectedFrame) -> Result<()> {
        let dir = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no capture session open"))?;
        let path = dir.join(format!("{:08}.raw", self.frame_index));
        let display = crate::frame::to_display(frame);
        let mut bytes = Vec::with_capacity(display.len() * 2);
        for sample in &display {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let mut file = fs::File::create(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("write {}", path.display()))?;
        self.frame_index += 1;
        Ok(())
    }
}

/// In-memory sink for tests and headless runs. Clones share storage,
/// so a caller can keep a handle while the pipeline owns the sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryLog>>,
}

#[derive(Default)]
struct MemoryLog {
    sessions: usize,
    frames: Vec<CorrectedFrame>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> usize {
        self.lock().sessions
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn frames(&self) -> Vec<CorrectedFrame> {
        self.lock().frames.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for MemorySink {
    fn begin_session(&mut self) -> Result<()> {
        self.lock().sessions += 1;
        Ok(())
    }

    fn accept(&mut self, frame: &CorrectedFrame) -> Result<()> {
        self.lock().frames.push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn tiny_frame(fill: f32) -> CorrectedFrame {
        let resolution = Resolution {
            width: 8,
            height: 8,
            band_width: 4,
            band_height: 4,
            framerate: 1,
        };
        CorrectedFrame {
            values: vec![fill; resolution.frame_samples()],
            resolution,
        }
    }

    #[test]
    fn accept_without_session_is_an_error() {
        let mut sink = RawFileSink::new("/tmp/unused");
        assert!(sink.accept(&tiny_frame(0.5)).is_err());
    }

    #[test]
    fn writes_numbered_frames_with_display_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(dir.path());
        sink.begin_session().unwrap();
        sink.accept(&tiny_frame(1.0)).unwrap();
        sink.accept(&tiny_frame(0.0)).unwrap();

        let session = sink.session_dir().unwrap().to_path_buf();
        let first = fs::read(session.join("00000000.raw")).unwrap();
        let second = fs::read(session.join("00000001.raw")).unwrap();
        assert_eq!(first.len(), 4 * 4 * 4 * 2);
        assert_eq!(&first[..2], &4095u16.to_le_bytes());
        assert_eq!(&second[..2], &0u16.to_le_bytes());
    }

    #[test]
    fn each_session_gets_its_own_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawFileSink::new(dir.path());
        sink.begin_session().unwrap();
        sink.accept(&tiny_frame(0.5)).unwrap();
        let first = sink.session_dir().unwrap().to_path_buf();

        // Session folders are named by epoch second.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        sink.begin_session().unwrap();
        let second = sink.session_dir().unwrap().to_path_buf();
        assert_ne!(first, second);
        sink.accept(&tiny_frame(0.5)).unwrap();
        assert!(second.join("00000000.raw").exists());
    }
}
