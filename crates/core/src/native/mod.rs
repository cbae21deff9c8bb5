//! Seam between the controller and the native render engine.

mod simulated;

pub use simulated::SimulatedEngine;

use crate::{
    BounceRequest, Driver, FullDuplexRequest, InputRecordingRequest, NotificationBridge,
    OutputConfig, RecordingRequest, SequencerHandle,
};

/// Operations the controller needs from a native render engine.
///
/// Implementations are shared between the render thread, which sits inside
/// [`NativeEngine::run_blocking`], and every other thread, so all methods take
/// `&self`.
pub trait NativeEngine: Send + Sync {
    /// Applies output parameters and hands over the sequencer to render.
    fn configure(&self, output: &OutputConfig, sequencer: SequencerHandle);

    /// Registers the bridge notifications are raised through, replacing any
    /// previous one. The engine answers with a bridge-connected notification.
    fn connect(&self, bridge: NotificationBridge);

    /// Renders until a stop is requested or the driver fails. A stop
    /// requested before the call is entered ends it immediately.
    fn run_blocking(&self);

    fn request_stop(&self);

    /// Drops a stop request that arrived after the last call had already
    /// finished rendering. Engines whose stop requests do not outlive a call
    /// can keep the default.
    fn clear_stop_request(&self) {}

    /// Clears internal buffers and pending recording state.
    fn reset_buffers(&self);

    /// Asks for an idle notification at the next point between buffers.
    fn notify_when_idle(&self);

    fn set_output_recording(&self, _request: Option<RecordingRequest>) {}

    fn set_bouncing(&self, _request: Option<BounceRequest>) {}

    fn set_input_recording(&self, _request: Option<InputRecordingRequest>) {}

    fn set_full_duplex_recording(&self, _request: Option<FullDuplexRequest>) {}

    /// Plays the device input back over the input channel while `active`.
    fn set_input_monitoring(&self, _active: bool) {}

    /// Switches the output driver. Takes effect on the next render call.
    fn set_driver(&self, _driver: Driver) {}

    /// Persists a recorded snippet; called from a non-render thread.
    fn save_recorded_snippet(&self, _index: i32) {}

    fn set_volume(&self, _volume: f32) {}
}
