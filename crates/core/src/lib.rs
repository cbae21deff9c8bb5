//! Core library for the render host.
//!
//! The crate owns the managed side of a real-time audio engine: a single
//! dedicated render thread driven through a strict lifecycle, pause/resume
//! hand-off without busy waiting, bounded restarts after driver failures,
//! cleanup deferred until the engine is idle, and the bridge that turns
//! native engine events into notifications for application code.
//!
//! The native engine itself is reached only through the [`NativeEngine`]
//! trait; [`SimulatedEngine`] stands in for it in tests and the command line
//! host.

pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod idle;
pub mod native;
pub mod notify;
pub mod record;
pub mod retry;
pub mod timeline;

pub use config::{Driver, EngineConfig, HostKind, OutputConfig, EMULATED_SAMPLE_RATE};
pub use controller::{EngineController, EngineRegistry, EngineState};
pub use error::{EngineError, Result};
pub use gate::PauseGate;
pub use idle::{IdleCallback, IdleCallbackQueue, IdleDisposition};
pub use native::{NativeEngine, SimulatedEngine};
pub use notify::{
    ChannelObserver, EngineObserver, Notification, NotificationBridge, NotificationDispatcher,
    NotificationId,
};
pub use record::{BounceRequest, FullDuplexRequest, InputRecordingRequest, RecordingRequest};
pub use retry::{RetryPolicy, DEFAULT_RETRY_CEILING};
pub use timeline::{Sequencer, SequencerHandle, StepEvent, TimeSignature};
