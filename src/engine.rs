//! Producer thread that owns the backend while capture is started.
//!
//! Each iteration waits for a free buffer, applies controls staged since the
//! previous iteration, reads one frame and hands it to the consumer. The
//! caller's thread only touches the shared state under [`Shared`]'s mutex, so
//! staging a control never blocks behind a frame read.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{FrameLease, FramePool, PoolStatus};
use crate::control::{ControlId, ControlTable, ControlValue};
use crate::error::{CameraError, Result};
use crate::format::{ActualFormat, FrameTimeout};
use crate::traits::{Backend, ReadOutcome};

/// Receives frames from the capture thread.
///
/// `on_frame` runs on the capture thread. With a single-buffer pool the next
/// frame is not captured until the lease is released.
pub trait FrameConsumer: Send {
    /// A frame is ready.
    fn on_frame(&mut self, frame: FrameLease);

    /// Capture stopped because of a terminal error.
    fn on_error(&mut self, _error: &CameraError) {}
}

impl<F> FrameConsumer for F
where
    F: FnMut(FrameLease) + Send,
{
    fn on_frame(&mut self, frame: FrameLease) {
        self(frame);
    }
}

/// Single-buffer handoff state between the capture thread and the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handoff {
    /// No frame delivered since the engine started.
    #[default]
    Idle,
    /// A frame is out with the consumer.
    FrameDelivered,
    /// The consumer gave a buffer back.
    FrameReleased,
    /// The caller asked the thread to finish.
    ExitRequested,
}

/// Counters kept by the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    /// Loop iterations completed.
    pub iterations: u64,
    /// Frames passed to the consumer.
    pub frames_delivered: u64,
    /// Reads that failed with a transient error.
    pub frames_dropped: u64,
    /// Reads that found no frame before the deadline.
    pub timeouts: u64,
}

/// State guarded by the engine mutex.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) handoff: Handoff,
    /// Set by `join`; only `spawn` clears it, so a late delivery or release
    /// cannot hide it from the loop.
    pub(crate) exit: bool,
    pub(crate) pool: FramePool,
    pub(crate) controls: ControlTable,
    pub(crate) format: ActualFormat,
    pub(crate) stats: CaptureStats,
    pub(crate) terminal: Option<CameraError>,
    pub(crate) temperature: Option<f32>,
}

/// Mutex plus the condition variable that signals every handoff change.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<EngineState>,
    changed: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, EngineState>) -> MutexGuard<'a, EngineState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a consumer-held buffer and wake the capture thread.
    pub(crate) fn release(&self, slot: usize, data: Vec<u8>) {
        let mut state = self.lock();
        state.pool.release(slot, data);
        if !state.exit {
            state.handoff = Handoff::FrameReleased;
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Backend and consumer, owned by whichever side is currently in charge.
pub(crate) struct Parked {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) consumer: Box<dyn FrameConsumer>,
}

/// Per-run knobs, taken from the configuration.
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub(crate) name: String,
    pub(crate) timeout: FrameTimeout,
    pub(crate) temperature_interval: Duration,
}

/// The capture thread and the state it shares with the camera handle.
pub struct CaptureEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Parked>>,
}

impl CaptureEngine {
    pub(crate) fn new(pool: FramePool, controls: ControlTable, format: ActualFormat) -> Self {
        let state = EngineState {
            handoff: Handoff::Idle,
            exit: false,
            pool,
            controls,
            format,
            stats: CaptureStats::default(),
            terminal: None,
            temperature: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
            worker: None,
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Whether a capture thread exists (it may have ended on a terminal error).
    pub const fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Whether the capture thread is alive and looping.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Current handoff state.
    pub fn handoff(&self) -> Handoff {
        self.shared.lock().handoff
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CaptureStats {
        self.shared.lock().stats
    }

    /// Snapshot of buffer ownership.
    pub fn pool_status(&self) -> PoolStatus {
        self.shared.lock().pool.status()
    }

    /// Terminal error that ended the last run, if any.
    pub fn terminal_error(&self) -> Option<CameraError> {
        self.shared.lock().terminal.clone()
    }

    /// Spawn the capture thread. On spawn failure the backend is lost with
    /// the closure, so the error is terminal.
    pub(crate) fn spawn(&mut self, parked: Parked, settings: EngineSettings) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.handoff = Handoff::Idle;
            state.exit = false;
            state.terminal = None;
        }
        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name(format!("capture-{}", settings.name))
            .spawn(move || run(&shared, parked, &settings))
            .map_err(|err| {
                let error = CameraError::CaptureThread(err.to_string());
                self.shared.lock().terminal = Some(error.clone());
                error
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Ask the thread to finish, join it and take back the backend and
    /// consumer. Returns `Ok(None)` when no thread was running.
    pub(crate) fn join(&mut self) -> Result<Option<Parked>> {
        let Some(worker) = self.worker.take() else {
            return Ok(None);
        };
        {
            let mut state = self.shared.lock();
            state.exit = true;
            state.handoff = Handoff::ExitRequested;
        }
        self.shared.changed.notify_all();

        let parked = worker.join().map_err(|_| {
            let error = CameraError::CaptureThread("capture thread panicked".to_owned());
            self.shared.lock().terminal = Some(error.clone());
            error
        })?;
        {
            let mut state = self.shared.lock();
            state.handoff = Handoff::Idle;
            state.exit = false;
        }
        Ok(Some(parked))
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("capture thread ended badly: {err}");
        }
    }
}

/// Push staged control changes to the backend and record what it accepted.
///
/// A write or commit that fails with `TransientIo` is staged again for the
/// next iteration unless the caller has staged something newer. Other
/// rejections are dropped with a warning. On a terminal error everything not
/// yet applied goes back to the table so the next `start` retries it.
pub(crate) fn flush_controls(
    backend: &mut dyn Backend,
    shared: &Shared,
    dirty: Vec<(ControlId, ControlValue)>,
) -> Result<()> {
    if dirty.is_empty() {
        return Ok(());
    }
    let mut pending = dirty.into_iter();
    let mut accepted = Vec::new();
    let mut retry = Vec::new();
    let mut failure = None;

    for (id, value) in pending.by_ref() {
        match backend.set_control(id, value) {
            Ok(()) => accepted.push((id, value)),
            Err(err) if err.is_terminal() => {
                retry.push((id, value));
                failure = Some(err);
                break;
            }
            Err(err @ CameraError::TransientIo(_)) => {
                log::warn!("failed to apply {id}={}, retrying: {err}", value.value);
                retry.push((id, value));
            }
            Err(err) => log::warn!("failed to apply {id}={}: {err}", value.value),
        }
    }
    retry.extend(pending);

    let mut applied = Vec::with_capacity(accepted.len());
    if failure.is_none() {
        match backend.commit_controls() {
            Ok(()) => {
                for &(id, value) in &accepted {
                    // The hardware may round; keep what it reports.
                    match backend.get_control(id) {
                        Ok(actual) => applied.push((id, actual)),
                        Err(err) if err.is_terminal() => {
                            failure = Some(err);
                            break;
                        }
                        Err(_) => applied.push((id, value)),
                    }
                }
            }
            Err(err) => {
                if !err.is_terminal() {
                    log::warn!("failed to commit {} control(s), retrying: {err}", accepted.len());
                }
                retry.append(&mut accepted);
                failure = Some(err).filter(CameraError::is_terminal);
            }
        }
    } else {
        retry.append(&mut accepted);
    }

    let mut state = shared.lock();
    for (id, value) in applied {
        log::debug!("applied {id}={} auto={}", value.value, value.auto);
        state.controls.record_applied(id, value);
    }
    for (id, value) in retry {
        state.controls.restage(id, value);
    }
    drop(state);
    failure.map_or(Ok(()), Err)
}

fn run(shared: &Arc<Shared>, mut parked: Parked, settings: &EngineSettings) -> Parked {
    log::debug!("capture thread {} running", settings.name);
    let backend = parked.backend.as_mut();
    let mut last_temperature: Option<Instant> = None;

    loop {
        let (dirty, checkout) = {
            let mut state = shared.lock();
            while !state.exit && state.pool.free_count() == 0 {
                state = shared.wait(state);
            }
            if state.exit {
                break;
            }
            (state.controls.take_dirty(), state.pool.checkout())
        };
        let Some((slot, mut buf)) = checkout else {
            continue;
        };

        if let Err(err) = flush_controls(backend, shared, dirty) {
            shared.lock().pool.checkin(slot, buf);
            lose_device(shared, parked.consumer.as_mut(), err);
            break;
        }

        if last_temperature.is_none_or(|at| at.elapsed() >= settings.temperature_interval) {
            let reading = backend.temperature();
            shared.lock().temperature = reading;
            last_temperature = Some(Instant::now());
        }

        let exposure = shared
            .lock()
            .controls
            .applied(ControlId::Exposure)
            .map(|v| v.value);
        let timeout = settings.timeout.for_exposure(exposure);

        match backend.read_frame(&mut buf, timeout) {
            Ok(ReadOutcome::Frame(metadata)) => {
                let format = {
                    let mut state = shared.lock();
                    if state.exit {
                        // Stop arrived during the read; nobody will release this.
                        state.pool.checkin(slot, buf);
                        break;
                    }
                    state.pool.deliver(slot);
                    state.handoff = Handoff::FrameDelivered;
                    state.stats.frames_delivered += 1;
                    state.stats.iterations += 1;
                    state.format
                };
                let lease = FrameLease::new(Arc::clone(shared), slot, buf, format, metadata);
                parked.consumer.on_frame(lease);
            }
            Ok(ReadOutcome::Timeout) | Err(CameraError::Timeout) => {
                let mut state = shared.lock();
                state.pool.checkin(slot, buf);
                state.stats.timeouts += 1;
                state.stats.iterations += 1;
            }
            Err(err) if err.is_terminal() => {
                shared.lock().pool.checkin(slot, buf);
                lose_device(shared, parked.consumer.as_mut(), err);
                break;
            }
            Err(err) => {
                log::warn!("dropped frame: {err}");
                let mut state = shared.lock();
                state.pool.checkin(slot, buf);
                state.stats.frames_dropped += 1;
                state.stats.iterations += 1;
            }
        }
    }

    backend.stop();
    log::debug!("capture thread {} finished", settings.name);
    parked
}

fn lose_device(shared: &Shared, consumer: &mut dyn FrameConsumer, err: CameraError) {
    log::error!("capture stopped: {err}");
    {
        let mut state = shared.lock();
        state.terminal = Some(err.clone());
        state.stats.iterations += 1;
    }
    consumer.on_error(&err);
}
