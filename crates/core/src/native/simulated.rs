use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::NativeEngine;
use crate::{
    BounceRequest, Driver, FullDuplexRequest, InputRecordingRequest, Notification,
    NotificationBridge, NotificationId, OutputConfig, RecordingRequest, SequencerHandle,
};

/// In-process stand-in for the native engine.
///
/// Buffers are "rendered" by sleeping for their wall-clock duration while the
/// sequencer advances, so the notification traffic matches a real device.
/// Driver failures can be injected with [`SimulatedEngine::fail_next_runs`].
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    state: Mutex<SimulatedState>,
    buffer_period: Option<Duration>,
    stop_requested: AtomicBool,
    idle_requested: AtomicBool,
    rendering: AtomicBool,
    pending_failures: AtomicU32,
    render_calls: AtomicUsize,
    buffers_rendered: AtomicU64,
    connections: AtomicUsize,
    resets: AtomicUsize,
}

#[derive(Debug, Default)]
struct SimulatedState {
    output: Option<OutputConfig>,
    sequencer: Option<SequencerHandle>,
    bridge: Option<NotificationBridge>,
    recording: Option<ActiveRecording>,
    input_recording: Option<ActiveRecording>,
    duplex_recording: Option<ActiveRecording>,
    monitoring_input: bool,
    bounce: Option<ActiveBounce>,
    reported_tempo: Option<f32>,
    volume: f32,
}

#[derive(Debug)]
struct ActiveRecording {
    snippet_size: usize,
    buffered: usize,
    next_snippet: i32,
}

impl ActiveRecording {
    fn new(snippet_size: usize) -> Self {
        Self {
            snippet_size: snippet_size.max(1),
            buffered: 0,
            next_snippet: 0,
        }
    }

    fn advance(&mut self, frames: usize, outgoing: &mut Vec<Notification>) {
        self.buffered += frames;
        while self.buffered >= self.snippet_size {
            self.buffered -= self.snippet_size;
            outgoing.push(Notification::WithValue {
                id: NotificationId::RecordedSnippetReady,
                value: self.next_snippet,
            });
            self.next_snippet += 1;
        }
    }
}

#[derive(Debug)]
struct ActiveBounce {
    request: BounceRequest,
    rendered: usize,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the time spent per buffer, which otherwise follows the
    /// configured buffer size and sample rate.
    pub fn with_buffer_period(mut self, period: Duration) -> Self {
        self.buffer_period = Some(period);
        self
    }

    /// Makes the next `count` render calls report a hardware failure and
    /// return immediately.
    pub fn fail_next_runs(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn buffers_rendered(&self) -> u64 {
        self.buffers_rendered.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn is_rendering(&self) -> bool {
        self.rendering.load(Ordering::SeqCst)
    }

    pub fn output(&self) -> Option<OutputConfig> {
        self.state.lock().output.clone()
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn is_recording_input(&self) -> bool {
        self.state.lock().input_recording.is_some()
    }

    pub fn is_recording_duplex(&self) -> bool {
        self.state.lock().duplex_recording.is_some()
    }

    pub fn is_monitoring_input(&self) -> bool {
        self.state.lock().monitoring_input
    }

    /// Swaps the slot selected by `slot` for `next` and reports the end of
    /// the previous recording.
    fn replace_recording<F>(&self, slot: F, next: Option<ActiveRecording>)
    where
        F: FnOnce(&mut SimulatedState) -> &mut Option<ActiveRecording>,
    {
        let finished = {
            let mut state = self.state.lock();
            std::mem::replace(slot(&mut state), next).is_some()
        };
        if finished {
            emit(
                self.bridge().as_ref(),
                Notification::Bare {
                    id: NotificationId::RecordingCompleted,
                },
            );
        }
    }

    fn bridge(&self) -> Option<NotificationBridge> {
        self.state.lock().bridge.clone()
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn render_buffer(&self, frames: usize, sequencer: Option<&SequencerHandle>) -> Vec<Notification> {
        let mut outgoing = Vec::new();

        if let Some(sequencer) = sequencer {
            let advanced = sequencer.with(|sequencer| {
                let marker = sequencer.marker();
                (sequencer.tempo(), sequencer.advance(frames), marker)
            });
            match advanced {
                Ok((tempo, steps, marker)) => {
                    {
                        let mut state = self.state.lock();
                        if state.reported_tempo != Some(tempo) {
                            state.reported_tempo = Some(tempo);
                            outgoing.push(Notification::WithValue {
                                id: NotificationId::SequencerTempoUpdated,
                                value: tempo.round() as i32,
                            });
                        }
                    }
                    for step in steps {
                        outgoing.push(Notification::WithValue {
                            id: NotificationId::SequencerPositionUpdated,
                            value: step.buffer_offset as i32,
                        });
                        if marker == Some(step.step) {
                            outgoing.push(Notification::Bare {
                                id: NotificationId::MarkerPositionReached,
                            });
                        }
                    }
                }
                Err(err) => warn!(%err, "skipping sequencer update"),
            }
        }

        {
            let mut state = self.state.lock();
            let SimulatedState {
                recording,
                input_recording,
                duplex_recording,
                ..
            } = &mut *state;
            for active in [recording, input_recording, duplex_recording] {
                if let Some(active) = active.as_mut() {
                    active.advance(frames, &mut outgoing);
                }
            }
            let bounced = state.bounce.as_mut().map(|bounce| {
                bounce.rendered += frames;
                bounce.rendered >= bounce.request.range.len()
            });
            if bounced == Some(true) {
                state.bounce = None;
                outgoing.push(Notification::Bare {
                    id: NotificationId::BounceComplete,
                });
            }
        }

        self.buffers_rendered.fetch_add(1, Ordering::SeqCst);
        if self.idle_requested.swap(false, Ordering::SeqCst) {
            outgoing.push(Notification::Bare {
                id: NotificationId::EngineIdle,
            });
        }
        outgoing
    }
}

fn emit(bridge: Option<&NotificationBridge>, notification: Notification) {
    if let Some(bridge) = bridge {
        bridge.dispatch(notification);
    }
}

impl NativeEngine for SimulatedEngine {
    fn configure(&self, output: &OutputConfig, sequencer: SequencerHandle) {
        let mut state = self.state.lock();
        state.output = Some(output.clone());
        state.sequencer = Some(sequencer);
        state.reported_tempo = None;
        state.recording = None;
        state.input_recording = None;
        state.duplex_recording = None;
        state.monitoring_input = false;
        state.bounce = None;
        state.volume = 1.0;
    }

    fn connect(&self, bridge: NotificationBridge) {
        self.state.lock().bridge = Some(bridge.clone());
        self.connections.fetch_add(1, Ordering::SeqCst);
        bridge.notify(NotificationId::BridgeConnected);
    }

    fn run_blocking(&self) {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        let (output, sequencer, bridge) = {
            let state = self.state.lock();
            (state.output.clone(), state.sequencer.clone(), state.bridge.clone())
        };

        let Some(output) = output.filter(|_| !self.take_failure()) else {
            debug!("simulated driver failure");
            emit(
                bridge.as_ref(),
                Notification::Bare {
                    id: NotificationId::HardwareUnavailable,
                },
            );
            return;
        };

        let period = self
            .buffer_period
            .unwrap_or_else(|| output.buffer_duration());
        self.rendering.store(true, Ordering::SeqCst);
        while !self.stop_requested.load(Ordering::SeqCst) {
            for notification in self.render_buffer(output.buffer_size, sequencer.as_ref()) {
                emit(bridge.as_ref(), notification);
            }
            thread::sleep(period);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.rendering.store(false, Ordering::SeqCst);
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn clear_stop_request(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    fn reset_buffers(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.idle_requested.store(false, Ordering::SeqCst);
        let sequencer = {
            let mut state = self.state.lock();
            state.recording = None;
            state.input_recording = None;
            state.duplex_recording = None;
            state.bounce = None;
            state.sequencer.clone()
        };
        if let Some(sequencer) = sequencer {
            if let Err(err) = sequencer.with(|sequencer| sequencer.rewind()) {
                warn!(%err, "could not rewind sequencer");
            }
        }
    }

    fn notify_when_idle(&self) {
        self.idle_requested.store(true, Ordering::SeqCst);
    }

    fn set_output_recording(&self, request: Option<RecordingRequest>) {
        self.replace_recording(
            |state| &mut state.recording,
            request.map(|request| ActiveRecording::new(request.snippet_size)),
        );
    }

    fn set_input_recording(&self, request: Option<InputRecordingRequest>) {
        if let Some(request) = &request {
            debug!(skip_processing = request.skip_processing, "recording device input");
        }
        self.replace_recording(
            |state| &mut state.input_recording,
            request.map(|request| ActiveRecording::new(request.snippet_size)),
        );
    }

    fn set_full_duplex_recording(&self, request: Option<FullDuplexRequest>) {
        if let Some(request) = &request {
            debug!(latency = ?request.roundtrip_latency, "recording full duplex");
        }
        self.replace_recording(
            |state| &mut state.duplex_recording,
            request.map(|request| ActiveRecording::new(request.snippet_size)),
        );
    }

    fn set_input_monitoring(&self, active: bool) {
        self.state.lock().monitoring_input = active;
    }

    fn set_driver(&self, driver: Driver) {
        if let Some(output) = self.state.lock().output.as_mut() {
            output.driver = driver;
        }
    }

    fn set_bouncing(&self, request: Option<BounceRequest>) {
        self.state.lock().bounce = request.map(|request| ActiveBounce {
            request,
            rendered: 0,
        });
    }

    fn save_recorded_snippet(&self, index: i32) {
        emit(
            self.bridge().as_ref(),
            Notification::WithValue {
                id: NotificationId::RecordedSnippetSaved,
                value: index,
            },
        );
    }

    fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::{unbounded, Receiver};

    use super::*;
    use crate::{ChannelObserver, IdleCallbackQueue, NotificationDispatcher};

    fn connected_engine() -> (Arc<SimulatedEngine>, SequencerHandle, Receiver<Notification>) {
        let engine = Arc::new(SimulatedEngine::new().with_buffer_period(Duration::from_millis(1)));
        let (tx, rx) = unbounded();
        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::new(IdleCallbackQueue::new())));
        dispatcher.set_observer(Arc::new(ChannelObserver::new(tx)));

        let sequencer = SequencerHandle::new(1_600);
        engine.configure(&OutputConfig::new(1_600, 100, 2, crate::Driver::OpenSl), sequencer.clone());
        engine.connect(NotificationBridge::new(dispatcher));
        (engine, sequencer, rx)
    }

    #[test]
    fn connect_announces_the_bridge() {
        let (engine, _, rx) = connected_engine();
        assert_eq!(engine.connections(), 1);
        assert_eq!(rx.try_recv().unwrap().id(), NotificationId::BridgeConnected);
    }

    #[test]
    fn injected_failure_returns_immediately() {
        let (engine, _, rx) = connected_engine();
        engine.fail_next_runs(1);

        engine.run_blocking();

        assert_eq!(engine.render_calls(), 1);
        assert_eq!(engine.buffers_rendered(), 0);
        let ids: Vec<_> = rx.try_iter().map(|n| n.id()).collect();
        assert_eq!(
            ids,
            vec![NotificationId::BridgeConnected, NotificationId::HardwareUnavailable]
        );
    }

    #[test]
    fn stop_requested_before_run_ends_it_promptly() {
        let (engine, _, _rx) = connected_engine();
        engine.request_stop();
        engine.run_blocking();

        assert!(!engine.is_rendering());
        assert_eq!(engine.buffers_rendered(), 0);
    }

    #[test]
    fn renders_steps_and_snippets_until_stopped() {
        let (engine, sequencer, rx) = connected_engine();
        sequencer.set_playing(true).unwrap();
        engine.set_output_recording(Some(RecordingRequest {
            output_path: "take.wav".into(),
            snippet_size: 400,
        }));

        let runner = {
            let engine = engine.clone();
            thread::spawn(move || engine.run_blocking())
        };
        let mut snippet = None;
        for notification in rx.iter() {
            if notification.id() == NotificationId::RecordedSnippetReady {
                snippet = notification.value();
                break;
            }
        }
        engine.request_stop();
        runner.join().unwrap();

        assert_eq!(snippet, Some(0));
        assert!(engine.buffers_rendered() >= 4);
        assert!(sequencer.step_position().unwrap() > 0);
    }

    #[test]
    fn tempo_changes_are_reported_once() {
        let (engine, sequencer, _rx) = connected_engine();
        let tempo_updates = |notifications: Vec<Notification>| -> Vec<Option<i32>> {
            notifications
                .into_iter()
                .filter(|n| n.id() == NotificationId::SequencerTempoUpdated)
                .map(|n| n.value())
                .collect()
        };

        assert_eq!(tempo_updates(engine.render_buffer(100, Some(&sequencer))), vec![Some(120)]);
        assert!(tempo_updates(engine.render_buffer(100, Some(&sequencer))).is_empty());

        sequencer
            .set_tempo(90.0, crate::TimeSignature::default())
            .unwrap();
        assert_eq!(tempo_updates(engine.render_buffer(100, Some(&sequencer))), vec![Some(90)]);
    }

    #[test]
    fn marker_is_reported_when_its_step_is_crossed() {
        let (engine, sequencer, _rx) = connected_engine();
        sequencer.set_playing(true).unwrap();
        // 200 samples per step at 1600 Hz, 120 BPM
        sequencer.set_marker(Some(2)).unwrap();

        let mut reached_at = None;
        for buffer in 0..8 {
            let notifications = engine.render_buffer(100, Some(&sequencer));
            if notifications
                .iter()
                .any(|n| n.id() == NotificationId::MarkerPositionReached)
            {
                reached_at = Some(buffer);
                break;
            }
        }
        assert_eq!(reached_at, Some(4));
    }

    #[test]
    fn cleared_stop_request_does_not_end_the_next_run() {
        let (engine, _, _rx) = connected_engine();
        engine.request_stop();
        engine.clear_stop_request();

        let runner = {
            let engine = engine.clone();
            thread::spawn(move || engine.run_blocking())
        };
        while engine.buffers_rendered() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        engine.request_stop();
        runner.join().unwrap();
        assert!(!engine.is_rendering());
    }

    #[test]
    fn input_and_duplex_recordings_produce_snippets() {
        let (engine, sequencer, rx) = connected_engine();
        engine.set_input_recording(Some(InputRecordingRequest {
            output_path: "mic.wav".into(),
            snippet_size: 200,
            skip_processing: true,
        }));
        engine.set_full_duplex_recording(Some(FullDuplexRequest {
            output_path: "duet.wav".into(),
            snippet_size: 300,
            roundtrip_latency: Duration::from_millis(12),
        }));
        assert!(engine.is_recording_input());
        assert!(engine.is_recording_duplex());

        let snippets = (0..3)
            .flat_map(|_| engine.render_buffer(100, Some(&sequencer)))
            .filter(|n| n.id() == NotificationId::RecordedSnippetReady)
            .count();
        assert_eq!(snippets, 2);

        engine.set_input_recording(None);
        engine.set_full_duplex_recording(None);
        assert!(!engine.is_recording_input());
        let completed = rx
            .try_iter()
            .filter(|n| n.id() == NotificationId::RecordingCompleted)
            .count();
        assert_eq!(completed, 2);
    }

    #[test]
    fn driver_switch_and_monitoring_update_the_output() {
        let (engine, _, _rx) = connected_engine();
        engine.set_driver(Driver::AAudio);
        engine.set_input_monitoring(true);

        assert_eq!(engine.output().unwrap().driver, Driver::AAudio);
        assert!(engine.is_monitoring_input());

        engine.configure(&OutputConfig::new(1_600, 100, 2, Driver::OpenSl), SequencerHandle::new(1_600));
        assert!(!engine.is_monitoring_input());
    }

    #[test]
    fn stopping_a_recording_reports_completion() {
        let (engine, _, rx) = connected_engine();
        engine.set_output_recording(Some(RecordingRequest::new("take.wav", 1_600)));
        engine.set_output_recording(None);
        engine.save_recorded_snippet(3);

        let received: Vec<_> = rx.try_iter().skip(1).collect();
        assert_eq!(
            received,
            vec![
                Notification::Bare {
                    id: NotificationId::RecordingCompleted
                },
                Notification::WithValue {
                    id: NotificationId::RecordedSnippetSaved,
                    value: 3
                },
            ]
        );
    }
}
