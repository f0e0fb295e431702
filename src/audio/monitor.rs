//! Noise-level monitor with explicit sampling-thread lifecycle ownership.
//!
//! `start` spawns one sampler thread that opens the input, reads fixed-size
//! blocks, and publishes a decibel reading each time the averaging window
//! closes. `stop` only flips the session's running flag; the thread notices at
//! the top of its next iteration and releases the input. Each session owns its
//! own flag so a quick stop/start pair cannot revive a loop that is winding down,
//! and a new session is never opened while the previous thread is alive.

use super::level::{LevelMeter, WindowAccumulator};
use super::source::{AudioSource, InputSpec, StreamGuard};
use super::BLOCK_SAMPLES;
use crate::clock::{Clock, SystemClock};
use crate::lock_or_recover;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SAMPLER_THREAD_NAME: &str = "nightshield-sampler";
const OPEN_TIMEOUT_MS: u64 = 2000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 1000;
const JOIN_POLL_MS: u64 = 5;

/// Errors surfaced to callers of [`NoiseLevelMonitor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// Window duration was not a positive, finite number of milliseconds.
    InvalidConfiguration(String),
    /// The audio input could not be opened (permission, busy, absent).
    ResourceUnavailable(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(detail) => write!(f, "invalid configuration: {detail}"),
            Self::ResourceUnavailable(detail) => {
                write!(f, "audio input unavailable: {detail}")
            }
        }
    }
}

impl std::error::Error for MonitorError {}

/// Cumulative sampler counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub blocks_read: u64,
    pub windows_closed: u64,
    pub samples_discarded: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    blocks_read: AtomicU64,
    windows_closed: AtomicU64,
    samples_discarded: AtomicU64,
}

struct SamplerSession {
    running: Arc<AtomicBool>,
    /// Set once the input opened; a session still opening is not listening.
    opened: bool,
    window_ms: f64,
    stop_requested_at: Option<Instant>,
    handle: JoinHandle<()>,
}

impl SamplerSession {
    fn is_listening(&self) -> bool {
        self.opened && self.running.load(Ordering::Acquire)
    }
}

/// Everything the sampler thread needs, moved in at spawn time.
struct SamplerContext {
    source: Arc<dyn AudioSource>,
    clock: Arc<dyn Clock>,
    spec: InputSpec,
    window: Duration,
    level: LevelMeter,
    counters: Arc<StatCounters>,
    running: Arc<AtomicBool>,
}

/// Clears the session's running flag however the sampler exits.
struct RunningFlagGuard(Arc<AtomicBool>);

impl Drop for RunningFlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Continuously samples an audio input and exposes the latest noise level.
pub struct NoiseLevelMonitor {
    source: Arc<dyn AudioSource>,
    clock: Arc<dyn Clock>,
    spec: InputSpec,
    level: LevelMeter,
    counters: Arc<StatCounters>,
    /// Serializes `start` and `shutdown`. Never held by `stop` or the readers.
    lifecycle: Mutex<()>,
    session: Mutex<Option<SamplerSession>>,
    stop_timeout: Duration,
}

impl NoiseLevelMonitor {
    #[must_use = "the monitor must be retained for its sampler to keep running"]
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self {
            source,
            clock: Arc::new(SystemClock),
            spec: InputSpec::default(),
            level: LevelMeter::new(),
            counters: Arc::new(StatCounters::default()),
            lifecycle: Mutex::new(()),
            session: Mutex::new(None),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound on how long `shutdown` (and a restart) waits for the sampler to exit.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Open the input and begin sampling with the given averaging window.
    ///
    /// No-op while already listening. Waits only for the input to open, so
    /// an open failure is returned here rather than lost on the sampler thread.
    /// Fails with `ResourceUnavailable` while a previous sampler is still
    /// holding the input; a later call retries.
    pub fn start(&self, window_duration_ms: f64) -> Result<(), MonitorError> {
        let window = window_from_ms(window_duration_ms)?;
        let _lifecycle = lock_or_recover(&self.lifecycle, "monitor lifecycle");

        let previous = {
            let mut session = lock_or_recover(&self.session, "monitor session");
            if session
                .as_ref()
                .is_some_and(|active| active.running.load(Ordering::Acquire))
            {
                tracing::debug!("start ignored: monitor already listening");
                return Ok(());
            }
            session.take()
        };
        // A previous loop may still be releasing the device.
        if let Some(previous) = previous {
            previous.running.store(false, Ordering::Release);
            if let Err(lingering) = reap_sampler(previous, self.stop_timeout) {
                *lock_or_recover(&self.session, "monitor session") = Some(lingering);
                tracing::warn!("start refused: previous sampler still holds the input");
                return Err(MonitorError::ResourceUnavailable(
                    "previous sampler has not released the input".to_string(),
                ));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let context = SamplerContext {
            source: Arc::clone(&self.source),
            clock: Arc::clone(&self.clock),
            spec: self.spec,
            window,
            level: self.level.clone(),
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&running),
        };
        let (ready_tx, ready_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(SAMPLER_THREAD_NAME.to_string())
            .spawn(move || run_sampler(context, ready_tx))
            .map_err(|err| {
                MonitorError::ResourceUnavailable(format!("failed to spawn sampler thread: {err}"))
            })?;
        // Publish before waiting so `stop` can reach a session that is still opening.
        *lock_or_recover(&self.session, "monitor session") = Some(SamplerSession {
            running: Arc::clone(&running),
            opened: false,
            window_ms: window_duration_ms,
            stop_requested_at: None,
            handle,
        });

        match ready_rx.recv_timeout(Duration::from_millis(OPEN_TIMEOUT_MS)) {
            Ok(Ok(())) => {
                if let Some(active) = lock_or_recover(&self.session, "monitor session").as_mut() {
                    active.opened = true;
                }
                tracing::debug!(window_ms = window_duration_ms, "monitor listening");
                Ok(())
            }
            Ok(Err(err)) => {
                running.store(false, Ordering::Release);
                self.discard_failed_start();
                tracing::warn!(error = %err, "monitor start failed");
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Keep the session so a later start or health check reaps it.
                running.store(false, Ordering::Release);
                if let Some(active) = lock_or_recover(&self.session, "monitor session").as_mut() {
                    active.stop_requested_at = Some(Instant::now());
                }
                tracing::warn!(timeout_ms = OPEN_TIMEOUT_MS, "audio input open timed out");
                Err(MonitorError::ResourceUnavailable(format!(
                    "audio input did not open within {OPEN_TIMEOUT_MS}ms"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                running.store(false, Ordering::Release);
                self.discard_failed_start();
                Err(MonitorError::ResourceUnavailable(
                    "sampler exited before the audio input opened".to_string(),
                ))
            }
        }
    }

    fn discard_failed_start(&self) {
        let Some(failed) = lock_or_recover(&self.session, "monitor session").take() else {
            return;
        };
        if let Err(lingering) = reap_sampler(failed, self.stop_timeout) {
            *lock_or_recover(&self.session, "monitor session") = Some(lingering);
        }
    }

    /// Ask the sampler to exit. Returns immediately; the input is released
    /// within one block read. No-op when idle.
    pub fn stop(&self) {
        let mut session = lock_or_recover(&self.session, "monitor session");
        if let Some(active) = session.as_mut() {
            if active.running.swap(false, Ordering::AcqRel) {
                tracing::debug!("monitor stop requested");
            }
            active.stop_requested_at.get_or_insert_with(Instant::now);
        }
    }

    /// Latest published level in dB. Never blocks.
    pub fn current_level(&self) -> f64 {
        self.level.level_db()
    }

    pub fn is_listening(&self) -> bool {
        lock_or_recover(&self.session, "monitor session")
            .as_ref()
            .map(SamplerSession::is_listening)
            .unwrap_or(false)
    }

    /// Window duration of the running session, if any.
    pub fn window_duration_ms(&self) -> Option<f64> {
        lock_or_recover(&self.session, "monitor session")
            .as_ref()
            .filter(|active| active.is_listening())
            .map(|active| active.window_ms)
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            blocks_read: self.counters.blocks_read.load(Ordering::Relaxed),
            windows_closed: self.counters.windows_closed.load(Ordering::Relaxed),
            samples_discarded: self.counters.samples_discarded.load(Ordering::Relaxed),
        }
    }

    /// Join a stopped sampler that has exited. Never blocks.
    ///
    /// Returns false while a stopped sampler is still holding the input longer
    /// than the stop timeout after it was asked to exit.
    pub fn reap_stopped(&self) -> bool {
        let mut session = lock_or_recover(&self.session, "monitor session");
        let Some(active) = session.as_mut() else {
            return true;
        };
        if active.running.load(Ordering::Acquire) {
            return true;
        }
        if active.handle.is_finished() {
            if let Some(done) = session.take() {
                if let Err(err) = done.handle.join() {
                    tracing::warn!("sampler thread panicked: {err:?}");
                }
            }
            return true;
        }
        let stopped_at = *active.stop_requested_at.get_or_insert_with(Instant::now);
        stopped_at.elapsed() <= self.stop_timeout
    }

    /// Stop and wait (bounded) for the sampler to release the input.
    ///
    /// Returns false if the sampler had to be detached because it did not exit
    /// in time, e.g. a read hung inside the platform driver.
    pub fn shutdown(&self) -> bool {
        let _lifecycle = lock_or_recover(&self.lifecycle, "monitor lifecycle");
        let Some(active) = lock_or_recover(&self.session, "monitor session").take() else {
            return true;
        };
        active.running.store(false, Ordering::Release);
        match reap_sampler(active, self.stop_timeout) {
            Ok(()) => true,
            Err(_detached) => {
                tracing::warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "sampler thread did not exit in time; detaching"
                );
                false
            }
        }
    }
}

impl Drop for NoiseLevelMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn window_from_ms(window_duration_ms: f64) -> Result<Duration, MonitorError> {
    if !window_duration_ms.is_finite() || window_duration_ms <= 0.0 {
        return Err(MonitorError::InvalidConfiguration(format!(
            "window duration must be a positive number of milliseconds, got {window_duration_ms}"
        )));
    }
    Duration::try_from_secs_f64(window_duration_ms / 1000.0).map_err(|err| {
        MonitorError::InvalidConfiguration(format!(
            "window duration {window_duration_ms}ms is out of range: {err}"
        ))
    })
}

fn run_sampler(context: SamplerContext, ready_tx: Sender<Result<(), MonitorError>>) {
    let _running_guard = RunningFlagGuard(Arc::clone(&context.running));

    let mut stream = match context.source.open(&context.spec) {
        Ok(stream) => StreamGuard::new(stream),
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut block = vec![0i16; BLOCK_SAMPLES];
    let blocks_per_window =
        (context.window.as_secs_f64() / context.spec.duration_of(BLOCK_SAMPLES).as_secs_f64())
            .ceil() as usize;
    let mut window =
        WindowAccumulator::with_expected_samples(blocks_per_window.saturating_mul(BLOCK_SAMPLES));
    let mut window_start = context.clock.now();

    while context.running.load(Ordering::Acquire) {
        let read = match stream.read_block(&mut block) {
            Ok(read) => read.min(block.len()),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "audio read failed; ending session");
                break;
            }
        };
        context.counters.blocks_read.fetch_add(1, Ordering::Relaxed);
        let discarded = window.push_block(&block[..read]);
        context
            .counters
            .samples_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);

        let now = context.clock.now();
        if window_elapsed(window_start, now, context.window) {
            context.level.publish(window.close_window());
            context.counters.windows_closed.fetch_add(1, Ordering::Relaxed);
            window_start = now;
        }
    }

    drop(stream);
    tracing::debug!("sampler loop exited");
}

/// Strictly greater: a window exactly `window` long stays open one more block.
fn window_elapsed(window_start: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(window_start) > window
}

/// Wait up to `timeout` for the sampler to exit, then join it. Hands the
/// session back if the thread is still running.
fn reap_sampler(session: SamplerSession, timeout: Duration) -> Result<(), SamplerSession> {
    let deadline = Instant::now() + timeout;
    while !session.handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(JOIN_POLL_MS));
    }
    if !session.handle.is_finished() {
        return Err(session);
    }
    if let Err(err) = session.handle.join() {
        tracing::warn!("sampler thread panicked: {err:?}");
    }
    Ok(())
}
