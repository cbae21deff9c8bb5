//! Lifecycle controller owning the dedicated render thread.
//!
//! The controller drives the native engine through
//! `Created -> Running <-> Paused -> Disposed` and back to `Created` via
//! [`EngineController::create`]. The render thread is spawned on the first
//! start and pooled afterwards: pausing and disposing only park it on the
//! [`PauseGate`]. It exits when the controller is dropped.

mod registry;

pub use registry::EngineRegistry;

use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::registry::RegistrySlot;
use crate::{
    BounceRequest, Driver, EngineConfig, EngineError, EngineObserver, FullDuplexRequest,
    IdleCallbackQueue, IdleDisposition, InputRecordingRequest, NativeEngine, NotificationBridge,
    NotificationDispatcher, NotificationId, PauseGate, RecordingRequest, Result, RetryPolicy,
    SequencerHandle,
};

/// Lifecycle state of the engine as seen by application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    /// The render thread is being spawned.
    Starting,
    Running,
    Paused,
    Disposed,
}

/// State shared with the render and watchdog threads.
struct Shared {
    engine: Arc<dyn NativeEngine>,
    dispatcher: Arc<NotificationDispatcher>,
    gate: PauseGate,
    lifecycle: Mutex<Lifecycle>,
    /// Whether the render thread is inside the native render call. Guarded so
    /// that entering the call and deciding to stop it cannot interleave.
    native_running: parking_lot::Mutex<bool>,
    rendering_confirmed: AtomicBool,
    disposed: AtomicBool,
    shutdown: AtomicBool,
    /// Bumped by every `start()` that lifts the pause flag.
    resume_epoch: AtomicU64,
    pause_settle_ms: AtomicU64,
    render_calls: AtomicUsize,
}

struct Lifecycle {
    state: EngineState,
    configured: bool,
    config: EngineConfig,
    retry: RetryPolicy,
    sequencer: Option<SequencerHandle>,
    render_thread: Option<JoinHandle<()>>,
    threads_spawned: usize,
    watchdog_armed: bool,
    slot: Option<RegistrySlot>,
}

impl Shared {
    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        self.lifecycle
            .lock()
            .map_err(|_| EngineError::Poisoned("engine lifecycle"))
    }

    /// Raises the pause flag and, when the native call is active, asks the
    /// engine to return from it.
    fn request_pause(&self) {
        self.gate.request_pause();
        let native_running = self.native_running.lock();
        if *native_running {
            self.engine.request_stop();
        }
    }

    fn pause_settle(&self) -> Duration {
        Duration::from_millis(self.pause_settle_ms.load(Ordering::SeqCst))
    }

    /// Enters the native render call unless a pause, disposal or shutdown is
    /// pending. Returns the resume epoch the call was entered under, or
    /// `None` when no call was made.
    fn render_once(&self) -> Option<u64> {
        let entered_epoch = {
            let mut native_running = self.native_running.lock();
            if *native_running
                || self.shutdown.load(Ordering::SeqCst)
                || self.disposed.load(Ordering::SeqCst)
                || self.gate.is_paused()
            {
                return None;
            }
            *native_running = true;
            self.resume_epoch.load(Ordering::SeqCst)
        };
        self.dispatcher.take_fault();
        let call = self.render_calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(call, "entering native render call");

        self.engine.run_blocking();

        {
            let mut native_running = self.native_running.lock();
            *native_running = false;
            // a pause that raced the end of the call must not end the next one
            self.engine.clear_stop_request();
        }
        let faulted = self.dispatcher.take_fault();
        if !faulted {
            self.rendering_confirmed.store(true, Ordering::SeqCst);
        }
        debug!(call, faulted, "native render call returned");
        Some(entered_epoch)
    }

    /// Raises the pause flag and marks a running engine `Paused`, unless it is
    /// already paused, disposed or shutting down. With `entered_epoch`, a
    /// `start()` issued since that epoch wins and nothing is parked.
    ///
    /// Returns whether the render thread should park.
    fn park(&self, entered_epoch: Option<u64>) -> Result<bool> {
        let mut lifecycle = self.lock_lifecycle()?;
        if self.shutdown.load(Ordering::SeqCst)
            || self.disposed.load(Ordering::SeqCst)
            || self.gate.is_paused()
        {
            return Ok(true);
        }
        if matches!(entered_epoch, Some(epoch) if epoch != self.resume_epoch.load(Ordering::SeqCst)) {
            return Ok(false);
        }

        self.gate.request_pause();
        if matches!(lifecycle.state, EngineState::Running | EngineState::Starting) {
            lifecycle.state = EngineState::Paused;
        }
        if entered_epoch.is_some() {
            warn!("native render call returned without a stop request; waiting for restart");
        }
        Ok(true)
    }

    /// Parks the engine after the native layer reported a hardware fault.
    /// Runs before the observer is told, so a restart issued from the
    /// observer always finds the engine paused.
    fn halt_after_fault(&self) {
        if let Err(err) = self.park(None) {
            self.gate.request_pause();
            warn!(%err, "could not record halted state");
        }
        warn!("native engine reported a hardware fault; waiting for restart");
    }
}

fn render_loop(shared: Arc<Shared>) {
    info!("render thread started");
    while !shared.shutdown.load(Ordering::SeqCst) {
        if let Some(entered_epoch) = shared.render_once() {
            match shared.park(Some(entered_epoch)) {
                Ok(true) => {}
                Ok(false) => {
                    // restarted while the call was winding down
                    thread::sleep(shared.pause_settle());
                    continue;
                }
                Err(err) => {
                    warn!(%err, "could not record halted state");
                    shared.gate.request_pause();
                }
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if shared.gate.is_paused() {
            if !shared.disposed.load(Ordering::SeqCst) {
                // lets a resume racing this pause land before we park
                thread::sleep(shared.pause_settle());
            }
            shared.gate.wait_while_paused();
        }
    }
    info!("render thread exiting");
}

fn spawn_watchdog(shared: Arc<Shared>, delay: Duration) {
    let spawned = thread::Builder::new()
        .name("engine-start-watchdog".to_string())
        .spawn(move || {
            thread::sleep(delay);
            if shared.disposed.load(Ordering::SeqCst) || shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let alive = *shared.native_running.lock() || shared.rendering_confirmed.load(Ordering::SeqCst);
            if !alive {
                warn!(?delay, "render thread did not confirm rendering in time");
                shared.dispatcher.notify(NotificationId::ThreadStartFailed);
            }
        });
    if let Err(err) = spawned {
        warn!(%err, "could not spawn start-up watchdog");
    }
}

/// Owner of the render thread and the single source of truth for engine state.
pub struct EngineController {
    shared: Arc<Shared>,
    registry: EngineRegistry,
}

impl EngineController {
    /// Claims the registry slot and returns an unconfigured controller.
    ///
    /// Fails with [`EngineError::AlreadyRegistered`] while another controller
    /// holds the slot.
    pub fn new(registry: &EngineRegistry, engine: Arc<dyn NativeEngine>) -> Result<Self> {
        let slot = registry.acquire()?;
        let config = EngineConfig::default();
        let idle_queue = Arc::new(IdleCallbackQueue::new());

        let shared = Shared {
            engine,
            dispatcher: Arc::new(NotificationDispatcher::new(idle_queue)),
            gate: PauseGate::new(),
            native_running: parking_lot::Mutex::new(false),
            rendering_confirmed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            resume_epoch: AtomicU64::new(0),
            pause_settle_ms: AtomicU64::new(config.pause_settle_ms),
            render_calls: AtomicUsize::new(0),
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Created,
                configured: false,
                retry: RetryPolicy::with_ceiling(config.retry_ceiling),
                config,
                sequencer: None,
                render_thread: None,
                threads_spawned: 0,
                watchdog_armed: false,
                slot: Some(slot),
            }),
        };

        let shared = Arc::new(shared);
        let weak = Arc::downgrade(&shared);
        shared.dispatcher.set_fault_hook(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.halt_after_fault();
            }
        }));

        Ok(Self {
            shared,
            registry: registry.clone(),
        })
    }

    /// Same as [`EngineController::new`] with an observer registered up front.
    pub fn with_observer(
        registry: &EngineRegistry,
        engine: Arc<dyn NativeEngine>,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self> {
        let controller = Self::new(registry, engine)?;
        controller.set_observer(observer);
        Ok(controller)
    }

    pub fn set_observer(&self, observer: Arc<dyn EngineObserver>) {
        self.shared.dispatcher.set_observer(observer);
    }

    pub fn clear_observer(&self) {
        self.shared.dispatcher.clear_observer();
    }

    /// Dispatcher the native layer raises notifications through.
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> Result<EngineState> {
        Ok(self.shared.lock_lifecycle()?.state)
    }

    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.shared.lock_lifecycle()?.configured)
    }

    pub fn config(&self) -> Result<EngineConfig> {
        Ok(self.shared.lock_lifecycle()?.config.clone())
    }

    /// Sequencer built by the last [`EngineController::create`].
    pub fn sequencer(&self) -> Result<Option<SequencerHandle>> {
        Ok(self.shared.lock_lifecycle()?.sequencer.clone())
    }

    /// Whether the render thread is currently inside the native render call.
    pub fn is_rendering(&self) -> bool {
        *self.shared.native_running.lock()
    }

    pub fn threads_spawned(&self) -> Result<usize> {
        Ok(self.shared.lock_lifecycle()?.threads_spawned)
    }

    pub fn render_calls(&self) -> usize {
        self.shared.render_calls.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> Result<u32> {
        Ok(self.shared.lock_lifecycle()?.retry.count())
    }

    /// Configures the native output and builds a fresh sequencer.
    ///
    /// Valid from `Created` and `Disposed`; after a disposal the registry slot
    /// is claimed again. Rendering does not start.
    pub fn create(&self, config: EngineConfig) -> Result<()> {
        let mut lifecycle = self.shared.lock_lifecycle()?;
        match lifecycle.state {
            EngineState::Created | EngineState::Disposed => {}
            state => {
                return Err(EngineError::InvalidTransition {
                    state,
                    operation: "create",
                })
            }
        }
        if lifecycle.slot.is_none() {
            lifecycle.slot = Some(self.registry.acquire()?);
        }

        let output = config.effective_output();
        if output.sample_rate != config.output.sample_rate {
            info!(
                requested = config.output.sample_rate,
                sample_rate = output.sample_rate,
                "clamping sample rate for emulated host"
            );
        }
        let sequencer = SequencerHandle::new(output.sample_rate);
        self.shared.engine.configure(&output, sequencer.clone());

        self.shared
            .pause_settle_ms
            .store(config.pause_settle_ms, Ordering::SeqCst);
        lifecycle.retry = RetryPolicy::with_ceiling(config.retry_ceiling);
        lifecycle.sequencer = Some(sequencer);
        lifecycle.config = config;
        lifecycle.configured = true;
        lifecycle.state = EngineState::Created;
        self.shared.disposed.store(false, Ordering::SeqCst);

        info!(
            sample_rate = output.sample_rate,
            buffer_size = output.buffer_size,
            channels = output.output_channels,
            driver = ?output.driver,
            "engine output configured"
        );
        Ok(())
    }

    /// Starts or resumes rendering. Starting a running engine is a no-op.
    ///
    /// The first call spawns the render thread; later calls only lift the
    /// pause flag. The notification bridge is re-registered every time.
    pub fn start(&self) -> Result<()> {
        if !self.startable()? {
            return Ok(());
        }
        // outside the lock: the engine answers with a notification
        self.shared
            .engine
            .connect(NotificationBridge::new(self.shared.dispatcher.clone()));

        let mut lifecycle = self.shared.lock_lifecycle()?;
        match lifecycle.state {
            EngineState::Running | EngineState::Starting => return Ok(()),
            EngineState::Disposed => {
                return Err(EngineError::InvalidTransition {
                    state: EngineState::Disposed,
                    operation: "start",
                })
            }
            EngineState::Created | EngineState::Paused => {}
        }
        self.shared.resume_epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.gate.resume();

        if lifecycle.render_thread.is_none() {
            lifecycle.state = EngineState::Starting;
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name("engine-render".to_string())
                .spawn(move || render_loop(shared));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    lifecycle.state = EngineState::Created;
                    return Err(EngineError::ThreadSpawn(err));
                }
            };
            lifecycle.render_thread = Some(handle);
            lifecycle.threads_spawned += 1;
            info!("render thread spawned");

            if !lifecycle.watchdog_armed {
                lifecycle.watchdog_armed = true;
                spawn_watchdog(self.shared.clone(), lifecycle.config.startup_watchdog());
            }
        }

        lifecycle.state = EngineState::Running;
        debug!("engine running");
        Ok(())
    }

    /// Pauses rendering without touching the render thread. Pausing an engine
    /// that is not running is a no-op.
    pub fn pause(&self) -> Result<()> {
        let mut lifecycle = self.shared.lock_lifecycle()?;
        if !matches!(lifecycle.state, EngineState::Running | EngineState::Starting) {
            return Ok(());
        }
        self.shared.request_pause();
        lifecycle.state = EngineState::Paused;
        debug!("engine paused");
        Ok(())
    }

    /// Pauses, resets the native engine and retry counter, drops the
    /// observer, and releases the registry slot. The render thread stays
    /// parked for reuse and this call does not wait for it.
    pub fn dispose(&self) -> Result<()> {
        let mut lifecycle = self.shared.lock_lifecycle()?;
        if lifecycle.state == EngineState::Disposed {
            return Ok(());
        }

        self.shared.disposed.store(true, Ordering::SeqCst);
        self.shared.request_pause();
        self.shared.engine.reset_buffers();
        lifecycle.retry.reset();

        let dropped = self.shared.dispatcher.idle_queue().clear();
        if dropped > 0 {
            warn!(dropped, "discarding idle callbacks pending at disposal");
        }
        self.shared.dispatcher.clear_observer();
        lifecycle.state = EngineState::Disposed;
        lifecycle.slot = None;
        info!("engine disposed");
        Ok(())
    }

    /// Records a restart attempt and reports whether one is still allowed.
    pub fn can_restart(&self) -> Result<bool> {
        let mut lifecycle = self.shared.lock_lifecycle()?;
        let permitted = lifecycle.retry.attempt();
        if !permitted {
            warn!(
                attempts = lifecycle.retry.count(),
                ceiling = lifecycle.retry.ceiling(),
                "restart attempts exhausted; reset() required"
            );
        }
        Ok(permitted)
    }

    /// Clears the retry counter and the native engine's buffers. The
    /// lifecycle state is left untouched and idle actions still queued keep
    /// waiting for the next idle notification.
    pub fn reset(&self) -> Result<()> {
        let mut lifecycle = self.shared.lock_lifecycle()?;
        lifecycle.retry.reset();
        self.shared.engine.reset_buffers();
        if !self.shared.dispatcher.idle_queue().is_empty() {
            self.shared.engine.notify_when_idle();
        }
        debug!("engine reset");
        Ok(())
    }

    /// Runs `action` once the engine sits between buffers, or right away when
    /// the sequencer is not playing.
    pub fn run_when_idle<F>(&self, action: F) -> Result<IdleDisposition>
    where
        F: FnOnce() + Send + 'static,
    {
        let sequencer = self.shared.lock_lifecycle()?.sequencer.clone();
        let playing = match sequencer {
            Some(sequencer) => sequencer.is_playing()?,
            None => false,
        };

        let disposition = self
            .shared
            .dispatcher
            .idle_queue()
            .run_when_idle(playing, action);
        if disposition == IdleDisposition::Deferred {
            self.shared.engine.notify_when_idle();
        }
        Ok(disposition)
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let sequencer = self.configured_sequencer("set volume")?;
        let volume = sequencer.with(|sequencer| {
            sequencer.set_volume(volume);
            sequencer.volume()
        })?;
        self.shared.engine.set_volume(volume);
        Ok(())
    }

    pub fn volume(&self) -> Result<f32> {
        self.configured_sequencer("read volume")?
            .with(|sequencer| sequencer.volume())
    }

    /// Records the engine output into `output_path` until stopped. The path
    /// is handed to the native layer as is.
    pub fn start_output_recording(&self, output_path: impl Into<PathBuf>) -> Result<()> {
        let sample_rate = self.configured_sample_rate("record")?;
        self.shared
            .engine
            .set_output_recording(Some(RecordingRequest::new(output_path, sample_rate)));
        Ok(())
    }

    pub fn stop_output_recording(&self) {
        self.shared.engine.set_output_recording(None);
    }

    /// Bounces `range` (in samples) of the sequencer into `output_path`; the
    /// current loop range is used when `range` is `None`.
    pub fn start_bouncing(
        &self,
        output_path: impl Into<PathBuf>,
        range: Option<Range<usize>>,
    ) -> Result<()> {
        let sequencer = self.configured_sequencer("bounce")?;
        let (sample_rate, loop_range) =
            sequencer.with(|sequencer| (sequencer.sample_rate(), sequencer.loop_range()))?;
        let range = range.unwrap_or(loop_range.0..loop_range.1 + 1);
        self.shared
            .engine
            .set_bouncing(Some(BounceRequest::new(output_path, range, sample_rate)));
        Ok(())
    }

    pub fn stop_bouncing(&self) {
        self.shared.engine.set_bouncing(None);
    }

    /// Records the device input into `output_path` until stopped, optionally
    /// bypassing the input channel's processing chain.
    pub fn start_input_recording(
        &self,
        output_path: impl Into<PathBuf>,
        skip_processing: bool,
    ) -> Result<()> {
        let sample_rate = self.input_sample_rate("record input")?;
        self.shared.engine.set_input_recording(Some(InputRecordingRequest::new(
            output_path,
            sample_rate,
            skip_processing,
        )));
        Ok(())
    }

    pub fn stop_input_recording(&self) {
        self.shared.engine.set_input_recording(None);
    }

    /// Records the engine output together with the device input, shifting
    /// the input back by `roundtrip_latency`.
    pub fn start_full_duplex_recording(
        &self,
        roundtrip_latency: Duration,
        output_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let sample_rate = self.input_sample_rate("record full duplex")?;
        self.shared
            .engine
            .set_full_duplex_recording(Some(FullDuplexRequest::new(
                output_path,
                sample_rate,
                roundtrip_latency,
            )));
        Ok(())
    }

    pub fn stop_full_duplex_recording(&self) {
        self.shared.engine.set_full_duplex_recording(None);
    }

    /// Toggles playback of the device input over the input channel.
    pub fn record_input(&self, active: bool) -> Result<()> {
        if active {
            self.input_sample_rate("monitor input")?;
        }
        self.shared.engine.set_input_monitoring(active);
        Ok(())
    }

    /// Switches the output driver. A running engine is paused and started
    /// again so the native layer reopens its output with the new driver.
    pub fn set_driver(&self, driver: Driver) -> Result<()> {
        let running = {
            let mut lifecycle = self.shared.lock_lifecycle()?;
            if lifecycle.config.output.driver == driver {
                return Ok(());
            }
            lifecycle.config.output.driver = driver;
            self.shared.engine.set_driver(driver);
            matches!(lifecycle.state, EngineState::Running | EngineState::Starting)
        };
        info!(?driver, running, "audio driver changed");

        if running {
            self.pause()?;
            self.start()?;
        }
        Ok(())
    }

    /// Persists a recorded snippet. Call from the thread handling
    /// `RecordedSnippetReady`, never from the observer callback itself.
    pub fn save_recorded_snippet(&self, index: i32) {
        self.shared.engine.save_recorded_snippet(index);
    }

    /// Validates a start request; `false` means the engine already runs.
    fn startable(&self) -> Result<bool> {
        let lifecycle = self.shared.lock_lifecycle()?;
        match lifecycle.state {
            EngineState::Running | EngineState::Starting => Ok(false),
            EngineState::Disposed => Err(EngineError::InvalidTransition {
                state: EngineState::Disposed,
                operation: "start",
            }),
            EngineState::Created if !lifecycle.configured => Err(EngineError::NotConfigured),
            EngineState::Created | EngineState::Paused => Ok(true),
        }
    }

    fn configured_sequencer(&self, operation: &'static str) -> Result<SequencerHandle> {
        let lifecycle = self.shared.lock_lifecycle()?;
        match (&lifecycle.sequencer, lifecycle.state) {
            (_, EngineState::Disposed) => Err(EngineError::InvalidTransition {
                state: EngineState::Disposed,
                operation,
            }),
            (Some(sequencer), _) => Ok(sequencer.clone()),
            (None, _) => Err(EngineError::NotConfigured),
        }
    }

    fn configured_sample_rate(&self, operation: &'static str) -> Result<u32> {
        self.configured_sequencer(operation)?
            .with(|sequencer| sequencer.sample_rate())
    }

    fn input_sample_rate(&self, operation: &'static str) -> Result<u32> {
        let sample_rate = self.configured_sample_rate(operation)?;
        if self.shared.lock_lifecycle()?.config.output.input_channels == 0 {
            return Err(EngineError::NoInputChannels);
        }
        Ok(sample_rate)
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.request_pause();
        self.shared.gate.resume();
        if let Ok(mut lifecycle) = self.shared.lifecycle.lock() {
            // detached; the thread leaves its loop on its own
            lifecycle.render_thread.take();
            lifecycle.slot = None;
        }
    }
}

impl std::fmt::Debug for EngineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineController")
            .field("state", &self.state().ok())
            .field("rendering", &self.is_rendering())
            .field("render_calls", &self.render_calls())
            .finish()
    }
}
