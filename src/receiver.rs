//! Image channel: a TCP server that reassembles fixed-length frames.
//!
//! The camera connects once per capture session and streams raw frames
//! back to back. TCP gives no message boundaries, so the receiver
//! accumulates reads until exactly one frame's worth of bytes is
//! buffered, then hands the buffer downstream by ownership. Frame
//! length is fixed by the session resolution, so no framing header is
//! needed.

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};

use crate::pipeline::LifecycleFlags;
use crate::{Resolution, LOOP_TIMEOUT_SECS};

/// Poll interval while waiting for a capture session or a client.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Per-read timeout. Short so the lifecycle flags are observed
/// promptly; forward progress is tracked separately.
const READ_SLICE: Duration = Duration::from_millis(250);

/// A read shorter than this is the camera's end-of-stream marker, not
/// frame data. Real frames are always delivered in larger pieces.
const STOP_MARKER_LEN: usize = 5;

const READ_CHUNK: usize = 64 * 1024;

enum FrameRead {
    /// A complete frame was assembled.
    Complete(Vec<u8>),
    /// The camera closed the stream or sent its stop marker.
    Disconnect,
    /// No forward progress within the timeout, or capture was stopped
    /// mid-frame; the partial buffer is discarded.
    Abandoned,
}

/// TCP server for the image channel. One camera client at a time; the
/// listening socket outlives individual sessions.
pub struct FrameReceiver {
    listener: TcpListener,
    resolution: Resolution,
    flags: LifecycleFlags,
}

impl FrameReceiver {
    pub fn new(
        listener: TcpListener,
        resolution: Resolution,
        flags: LifecycleFlags,
    ) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("set image listener non-blocking")?;
        Ok(Self {
            listener,
            resolution,
            flags,
        })
    }

    /// Stage body. Accepts camera sessions while capturing, forwards
    /// complete frames, and returns when the pipeline finishes.
    pub fn run(self, frames: SyncSender<Vec<u8>>) -> Result<()> {
        while !self.flags.finished() {
            if !self.flags.capturing() {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("camera connected to the image channel from {}", peer);
                    self.flags.set_connected(true);
                    match self.serve_session(stream, &frames) {
                        Ok(count) => log::info!("image session ended after {} frames", count),
                        Err(err) => log::error!("image session failed: {:#}", err),
                    }
                    self.flags.set_connected(false);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(err).context("accept image client"),
            }
        }
        Ok(())
    }

    fn serve_session(&self, mut stream: TcpStream, frames: &SyncSender<Vec<u8>>) -> Result<u64> {
        // The listener is non-blocking; the accepted stream must not be.
        stream
            .set_nonblocking(false)
            .context("set image stream blocking")?;
        stream
            .set_read_timeout(Some(READ_SLICE))
            .context("set image stream read timeout")?;
        let frame_len = self.resolution.frame_bytes();
        let mut count = 0u64;
        while self.flags.capturing() && !self.flags.finished() {
            match self.read_frame(&mut stream, frame_len)? {
                FrameRead::Complete(buf) => {
                    // Bounded queue: a full queue blocks the network
                    // intake rather than growing memory. A closed queue
                    // means the pipeline is going away.
                    if frames.send(buf).is_err() {
                        return Ok(count);
                    }
                    count += 1;
                }
                FrameRead::Disconnect => return Ok(count),
                FrameRead::Abandoned => continue,
            }
        }
        Ok(count)
    }

    /// Accumulate exactly one frame. Reads arrive in arbitrary-size
    /// chunks; a 2 s stall mid-frame abandons the partial buffer.
    fn read_frame(&self, stream: &mut TcpStream, frame_len: usize) -> Result<FrameRead> {
        let mut buf = Vec::with_capacity(frame_len);
        let mut chunk = [0u8; READ_CHUNK];
        let timeout = Duration::from_secs(LOOP_TIMEOUT_SECS);
        let mut last_progress = Instant::now();
        loop {
            if self.flags.finished() || !self.flags.capturing() {
                return Ok(FrameRead::Abandoned);
            }
            let want = (frame_len - buf.len()).min(READ_CHUNK);
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(FrameRead::Disconnect),
                Ok(n) if n < STOP_MARKER_LEN => {
                    log::info!("camera sent its stop marker");
                    return Ok(FrameRead::Disconnect);
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    last_progress = Instant::now();
                    if buf.len() == frame_len {
                        return Ok(FrameRead::Complete(buf));
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    if last_progress.elapsed() >= timeout {
                        if buf.is_empty() {
                            // Idle between frames; keep waiting, the
                            // flags above bound how long.
                            last_progress = Instant::now();
                        } else {
                            log::warn!(
                                "abandoning partial frame ({} of {} bytes) after {}s stall",
                                buf.len(),
                                frame_len,
                                LOOP_TIMEOUT_SECS
                            );
                            return Ok(FrameRead::Abandoned);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err).context("read image channel"),
            }
        }
    }
}
