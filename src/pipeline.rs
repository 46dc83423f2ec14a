//! Capture lifecycle and stage wiring.
//!
//! The orchestrator owns three stage threads connected by bounded
//! queues:
//!
//! ```text
//! receive (TCP bytes) -> process (decode, correct, demosaic) -> consume (sink)
//! ```
//!
//! and runs the control loop on its own thread. Lifecycle state lives
//! in [`LifecycleFlags`]; stages poll the flags at every blocking
//! point, so Close is observed within one timeout interval everywhere.
//!
//! Stop is graceful: it only stops the intake of new network frames.
//! Frames already queued keep flowing downstream until the queues are
//! empty, so nothing captured before Stop is lost.

use anyhow::{Context, Result};
use std::net::TcpListener;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::calibration::{CalibrationAnalysis, CalibrationReference};
use crate::command::ControlCommand;
use crate::correct::RadiometricCorrector;
use crate::demosaic::BandDemosaicer;
use crate::frame::{decode_frame, CorrectedFrame};
use crate::receiver::FrameReceiver;
use crate::sink::FrameSink;
use crate::{Resolution, LOOP_TIMEOUT_SECS};

/// Capacity of each inter-stage queue, in frames. Keeps memory bounded
/// at HIGH resolution while riding out short consumer stalls.
const FRAME_QUEUE_DEPTH: usize = 4;

/// Control loop poll interval.
const CONTROL_POLL: Duration = Duration::from_millis(100);

/// Grace period between sending CLOSE to the camera and tearing the
/// stages down, so in-flight frames and the camera's shutdown settle.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Shared lifecycle state. Cheap to clone; every stage holds one.
#[derive(Clone, Default)]
pub struct LifecycleFlags {
    connected: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl LifecycleFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    pub fn capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn set_capturing(&self, value: bool) {
        self.capturing.store(value, Ordering::SeqCst);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Observable pipeline state. `Closing` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Capturing,
    Closing,
}

/// Messages to the consume stage. Session markers travel through the
/// same FIFO queue as frames, which keeps them ordered relative to the
/// frames around them.
enum SinkCommand {
    BeginSession,
    Frame(CorrectedFrame),
}

/// Everything the pipeline needs at spawn time. Bind the image
/// listener before constructing this; a port conflict should fail the
/// daemon at startup, not mid-capture.
pub struct CaptureOrchestrator {
    pub resolution: Resolution,
    pub reference: Arc<CalibrationReference>,
    pub analysis: Arc<CalibrationAnalysis>,
    pub image_listener: TcpListener,
    pub outbound: Sender<ControlCommand>,
    pub sink: Box<dyn FrameSink>,
    pub save: bool,
}

impl CaptureOrchestrator {
    /// Spawn the stage threads and the control loop.
    pub fn spawn(self) -> Result<PipelineHandle> {
        let (command_tx, command_rx) = mpsc::channel();
        let flags = LifecycleFlags::new();
        let state = Arc::new(Mutex::new(PipelineState::Idle));
        let control_flags = flags.clone();
        let control_state = state.clone();
        let control = std::thread::Builder::new()
            .name("pipeline-control".into())
            .spawn(move || self.run(command_rx, control_flags, control_state))
            .context("spawn pipeline control thread")?;
        Ok(PipelineHandle {
            commands: command_tx,
            flags,
            state,
            control,
        })
    }

    fn run(
        self,
        commands: Receiver<ControlCommand>,
        flags: LifecycleFlags,
        state: Arc<Mutex<PipelineState>>,
    ) -> Result<()> {
        let CaptureOrchestrator {
            resolution,
            reference,
            analysis,
            image_listener,
            outbound,
            mut sink,
            save,
        } = self;

        let (raw_tx, raw_rx) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let (sink_tx, sink_rx) = mpsc::sync_channel::<SinkCommand>(FRAME_QUEUE_DEPTH);
        let session_tx = sink_tx.clone();

        let receiver = FrameReceiver::new(image_listener, resolution, flags.clone())?;
        let receive_flags = flags.clone();
        let receive = std::thread::Builder::new()
            .name("pipeline-receive".into())
            .spawn(move || {
                if let Err(err) = receiver.run(raw_tx) {
                    log::error!("image channel stage failed: {:#}", err);
                    receive_flags.set_capturing(false);
                }
            })
            .context("spawn receive stage")?;

        let corrector = RadiometricCorrector::new(reference, analysis.clone());
        let demosaicer = BandDemosaicer::new(analysis);
        let process_flags = flags.clone();
        let process = std::thread::Builder::new()
            .name("pipeline-process".into())
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    process_loop(raw_rx, sink_tx, &corrector, &demosaicer, &process_flags, resolution)
                }));
                if outcome.is_err() {
                    log::error!("processing stage panicked; stopping capture");
                    process_flags.set_capturing(false);
                }
            })
            .context("spawn process stage")?;

        let consume_flags = flags.clone();
        let consume = std::thread::Builder::new()
            .name("pipeline-consume".into())
            .spawn(move || consume_loop(sink_rx, sink.as_mut(), save, &consume_flags))
            .context("spawn consume stage")?;

        control_loop(commands, &outbound, &flags, &state, session_tx);

        // Closing: CLOSE goes to the camera first so it stops sending,
        // then a grace interval lets queued frames finish draining.
        log::info!("closing pipeline");
        send_outbound(&outbound, ControlCommand::Close);
        flags.set_capturing(false);
        std::thread::sleep(CLOSE_GRACE);
        flags.finish();

        join_stage("receive", receive);
        join_stage("process", process);
        join_stage("consume", consume);
        log::info!("pipeline closed");
        Ok(())
    }
}

fn control_loop(
    commands: Receiver<ControlCommand>,
    outbound: &Sender<ControlCommand>,
    flags: &LifecycleFlags,
    shared_state: &Mutex<PipelineState>,
    session_tx: SyncSender<SinkCommand>,
) {
    let mut state = PipelineState::Idle;
    let enter = |state: &mut PipelineState, next: PipelineState| {
        *state = next;
        *shared_state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    };
    loop {
        let command = match commands.recv_timeout(CONTROL_POLL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => {
                // A stage failure or idle-detection clears the
                // capturing flag underneath us; fold it back into
                // the state machine.
                if state == PipelineState::Capturing && !flags.capturing() {
                    log::info!("capture stopped by the pipeline");
                    enter(&mut state, PipelineState::Idle);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                enter(&mut state, PipelineState::Closing);
                return;
            }
        };
        if let Err(err) = command.validate() {
            log::error!("rejected {}: {:#}", command.key(), err);
            continue;
        }
        match command {
            ControlCommand::Start => {
                if state == PipelineState::Capturing && flags.capturing() {
                    log::debug!("already capturing; START ignored");
                    continue;
                }
                if session_tx.send(SinkCommand::BeginSession).is_err() {
                    log::error!("consume stage is gone; START ignored");
                    continue;
                }
                flags.set_capturing(true);
                enter(&mut state, PipelineState::Capturing);
                send_outbound(outbound, ControlCommand::Start);
                log::info!("capture started");
            }
            ControlCommand::Stop => {
                if state != PipelineState::Capturing {
                    log::debug!("not capturing; STOP ignored");
                    continue;
                }
                send_outbound(outbound, ControlCommand::Stop);
                flags.set_capturing(false);
                enter(&mut state, PipelineState::Idle);
                log::info!("capture stopped; queued frames keep draining");
            }
            ControlCommand::Exposure(value) => {
                if state == PipelineState::Capturing {
                    log::error!("exposure can only change while stopped");
                    continue;
                }
                send_outbound(outbound, command);
                log::info!("exposure set to {} us", value);
            }
            ControlCommand::Close => {
                enter(&mut state, PipelineState::Closing);
                return;
            }
        }
    }
}

fn process_loop(
    raw_rx: Receiver<Vec<u8>>,
    sink_tx: SyncSender<SinkCommand>,
    corrector: &RadiometricCorrector,
    demosaicer: &BandDemosaicer,
    flags: &LifecycleFlags,
    resolution: Resolution,
) {
    let timeout = Duration::from_secs(LOOP_TIMEOUT_SECS);
    // True once data flowed during the current capture session, so a
    // camera that disconnects cleanly still trips the stall detector.
    let mut session_seen = false;
    loop {
        if !flags.capturing() {
            session_seen = false;
        } else if flags.connected() {
            session_seen = true;
        }
        match raw_rx.recv_timeout(timeout) {
            Ok(bytes) => {
                session_seen = true;
                let started = std::time::Instant::now();
                let raw = match decode_frame(&bytes, resolution) {
                    Ok(raw) => raw,
                    Err(err) => {
                        log::warn!("dropping malformed frame: {:#}", err);
                        continue;
                    }
                };
                let corrected = demosaicer.demosaic(&corrector.correct(&raw));
                log::debug!(
                    "frame processed in {:.1} ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
                if sink_tx.send(SinkCommand::Frame(corrected)).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if flags.finished() {
                    return;
                }
                // Idle detection: a camera that connected and then went
                // silent or dropped mid-capture will never complete
                // another frame.
                if flags.capturing() && (flags.connected() || session_seen) {
                    log::warn!(
                        "no frames for {}s while capturing; stopping capture",
                        LOOP_TIMEOUT_SECS
                    );
                    flags.set_capturing(false);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn consume_loop(
    sink_rx: Receiver<SinkCommand>,
    sink: &mut dyn FrameSink,
    save: bool,
    flags: &LifecycleFlags,
) {
    let timeout = Duration::from_secs(LOOP_TIMEOUT_SECS);
    let mut session_frames = 0u64;
    loop {
        match sink_rx.recv_timeout(timeout) {
            Ok(SinkCommand::BeginSession) => {
                if session_frames > 0 {
                    log::info!("session finished with {} frames", session_frames);
                }
                session_frames = 0;
                if save {
                    if let Err(err) = sink.begin_session() {
                        log::error!("session setup failed: {:#}", err);
                    }
                }
            }
            Ok(SinkCommand::Frame(frame)) => {
                if save {
                    match sink.accept(&frame) {
                        Ok(()) => session_frames += 1,
                        Err(err) => log::error!("dropping frame: {:#}", err),
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if flags.finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if session_frames > 0 {
        log::info!("session finished with {} frames", session_frames);
    }
}

fn send_outbound(outbound: &Sender<ControlCommand>, command: ControlCommand) {
    if outbound.send(command).is_err() {
        log::warn!("command channel closed; {} not delivered", command.key());
    }
}

fn join_stage(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("{} stage panicked during shutdown", name);
    }
}

/// Caller-side handle. Commands go in; `close` tears everything down
/// and joins the control thread.
pub struct PipelineHandle {
    commands: Sender<ControlCommand>,
    flags: LifecycleFlags,
    state: Arc<Mutex<PipelineState>>,
    control: JoinHandle<Result<()>>,
}

impl PipelineHandle {
    pub fn send(&self, command: ControlCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("pipeline is closed"))
    }

    /// Last state the control loop entered.
    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_capturing(&self) -> bool {
        self.flags.capturing()
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected()
    }

    /// Send CLOSE and wait for every stage to join.
    pub fn close(self) -> Result<()> {
        let _ = self.commands.send(ControlCommand::Close);
        match self.control.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("pipeline control thread panicked")),
        }
    }
}
