//! Bridge between notifications raised by the native engine and application
//! code.
//!
//! The native layer speaks in two shapes only: a bare identifier, or an
//! identifier with an integer payload. [`NotificationDispatcher`] receives
//! both, diverts idle notifications to the [`IdleCallbackQueue`] when actions
//! are pending, and forwards everything else to a single [`EngineObserver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::IdleCallbackQueue;

/// Closed catalogue of identifiers the native engine may broadcast.
///
/// The discriminants are the ordinals exchanged with the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum NotificationId {
    /// The sequencer advanced a step; payload is the buffer offset.
    SequencerPositionUpdated = 0,
    MarkerPositionReached = 1,
    /// Tempo changed; payload is the new tempo in whole BPM.
    SequencerTempoUpdated = 2,
    /// A recording snippet is ready to be written; payload is its buffer index.
    RecordedSnippetReady = 3,
    /// A recording snippet was written; payload is its buffer index.
    RecordedSnippetSaved = 4,
    RecordingCompleted = 5,
    BounceComplete = 6,
    BridgeConnected = 7,
    HardwareUnavailable = 8,
    ThreadStartFailed = 9,
    EngineIdle = 10,
}

impl NotificationId {
    pub const ALL: [NotificationId; 11] = [
        NotificationId::SequencerPositionUpdated,
        NotificationId::MarkerPositionReached,
        NotificationId::SequencerTempoUpdated,
        NotificationId::RecordedSnippetReady,
        NotificationId::RecordedSnippetSaved,
        NotificationId::RecordingCompleted,
        NotificationId::BounceComplete,
        NotificationId::BridgeConnected,
        NotificationId::HardwareUnavailable,
        NotificationId::ThreadStartFailed,
        NotificationId::EngineIdle,
    ];

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.ordinal() == ordinal)
    }

    /// Whether the identifier reports a failure of the audio pipeline.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            NotificationId::HardwareUnavailable | NotificationId::ThreadStartFailed
        )
    }
}

/// A single message from the engine, in one of its two shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Notification {
    Bare { id: NotificationId },
    WithValue { id: NotificationId, value: i32 },
}

impl Notification {
    pub fn id(&self) -> NotificationId {
        match self {
            Notification::Bare { id } | Notification::WithValue { id, .. } => *id,
        }
    }

    pub fn value(&self) -> Option<i32> {
        match self {
            Notification::Bare { .. } => None,
            Notification::WithValue { value, .. } => Some(*value),
        }
    }
}

/// Receiver of engine notifications.
///
/// Both methods are invoked on the engine's thread. They must not block, and
/// must not call back into the controller synchronously; hand the work to
/// another thread instead (see [`ChannelObserver`]).
pub trait EngineObserver: Send + Sync {
    fn handle_notification(&self, id: NotificationId);

    fn handle_notification_with_value(&self, id: NotificationId, value: i32);
}

/// Observer that hands every notification to another thread through a
/// channel, for handlers that need to do I/O.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<Notification>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }

    fn forward(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!(?notification, "notification receiver has gone away");
        }
    }
}

impl EngineObserver for ChannelObserver {
    fn handle_notification(&self, id: NotificationId) {
        self.forward(Notification::Bare { id });
    }

    fn handle_notification_with_value(&self, id: NotificationId, value: i32) {
        self.forward(Notification::WithValue { id, value });
    }
}

/// Routes native notifications to the idle queue or the registered observer.
pub struct NotificationDispatcher {
    observer: RwLock<Option<Arc<dyn EngineObserver>>>,
    idle_queue: Arc<IdleCallbackQueue>,
    fault_raised: AtomicBool,
    fault_hook: RwLock<Option<FaultHook>>,
}

/// Runs before the observer hears about a hardware failure.
pub(crate) type FaultHook = Box<dyn Fn() + Send + Sync>;

impl NotificationDispatcher {
    pub fn new(idle_queue: Arc<IdleCallbackQueue>) -> Self {
        Self {
            observer: RwLock::new(None),
            idle_queue,
            fault_raised: AtomicBool::new(false),
            fault_hook: RwLock::new(None),
        }
    }

    /// Registers the observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn EngineObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        self.observer.write().take();
    }

    pub fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }

    pub fn idle_queue(&self) -> &Arc<IdleCallbackQueue> {
        &self.idle_queue
    }

    /// Entry point for bare notifications.
    ///
    /// An idle notification with pending callbacks drains the queue and is
    /// not forwarded; without pending callbacks it reaches the observer.
    pub fn notify(&self, id: NotificationId) {
        if id == NotificationId::HardwareUnavailable {
            self.fault_raised.store(true, Ordering::SeqCst);
            if let Some(hook) = self.fault_hook.read().as_ref() {
                hook();
            }
        }
        if id == NotificationId::EngineIdle && !self.idle_queue.is_empty() {
            let executed = self.idle_queue.drain();
            debug!(executed, "drained idle callbacks");
            return;
        }
        if let Some(observer) = self.current_observer() {
            observer.handle_notification(id);
        }
    }

    /// Entry point for notifications carrying a payload.
    pub fn notify_with_value(&self, id: NotificationId, value: i32) {
        if let Some(observer) = self.current_observer() {
            observer.handle_notification_with_value(id, value);
        }
    }

    pub fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::Bare { id } => self.notify(id),
            Notification::WithValue { id, value } => self.notify_with_value(id, value),
        }
    }

    /// Decodes a native ordinal; unknown ordinals are dropped.
    pub fn notify_raw(&self, ordinal: i32) {
        match NotificationId::from_ordinal(ordinal) {
            Some(id) => self.notify(id),
            None => warn!(ordinal, "dropping notification with unknown identifier"),
        }
    }

    pub fn notify_raw_with_value(&self, ordinal: i32, value: i32) {
        match NotificationId::from_ordinal(ordinal) {
            Some(id) => self.notify_with_value(id, value),
            None => warn!(ordinal, value, "dropping notification with unknown identifier"),
        }
    }

    pub(crate) fn set_fault_hook(&self, hook: FaultHook) {
        *self.fault_hook.write() = Some(hook);
    }

    /// Returns whether a hardware failure was reported since the last call.
    pub(crate) fn take_fault(&self) -> bool {
        self.fault_raised.swap(false, Ordering::SeqCst)
    }

    // the observer is cloned out so it never runs under the lock
    fn current_observer(&self) -> Option<Arc<dyn EngineObserver>> {
        self.observer.read().clone()
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("has_observer", &self.has_observer())
            .field("idle_queue", &self.idle_queue)
            .finish()
    }
}

/// Cloneable handle the native engine uses to raise notifications.
#[derive(Debug, Clone)]
pub struct NotificationBridge {
    dispatcher: Arc<NotificationDispatcher>,
}

impl NotificationBridge {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn notify(&self, id: NotificationId) {
        self.dispatcher.notify(id);
    }

    pub fn notify_with_value(&self, id: NotificationId, value: i32) {
        self.dispatcher.notify_with_value(id, value);
    }

    pub fn dispatch(&self, notification: Notification) {
        self.dispatcher.dispatch(notification);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;

    fn dispatcher_with_channel() -> (
        NotificationDispatcher,
        crossbeam_channel::Receiver<Notification>,
    ) {
        let (tx, rx) = unbounded();
        let dispatcher = NotificationDispatcher::new(Arc::new(IdleCallbackQueue::new()));
        dispatcher.set_observer(Arc::new(ChannelObserver::new(tx)));
        (dispatcher, rx)
    }

    #[test]
    fn ordinals_round_trip_through_catalogue() {
        for id in NotificationId::ALL {
            assert_eq!(NotificationId::from_ordinal(id.ordinal()), Some(id));
        }
        assert_eq!(NotificationId::from_ordinal(42), None);
    }

    #[test]
    fn forwards_both_shapes_verbatim() {
        let (dispatcher, rx) = dispatcher_with_channel();

        dispatcher.notify(NotificationId::MarkerPositionReached);
        dispatcher.notify_with_value(NotificationId::SequencerPositionUpdated, 512);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Notification::Bare {
                id: NotificationId::MarkerPositionReached
            }
        );
        let step = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(step.id(), NotificationId::SequencerPositionUpdated);
        assert_eq!(step.value(), Some(512));
    }

    #[test]
    fn idle_with_pending_callbacks_drains_instead_of_forwarding() {
        let (dispatcher, rx) = dispatcher_with_channel();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        dispatcher.idle_queue().run_when_idle(true, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.notify(NotificationId::EngineIdle);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        dispatcher.notify(NotificationId::EngineIdle);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(
            rx.try_recv().unwrap().id(),
            NotificationId::EngineIdle
        );
    }

    #[test]
    fn unknown_ordinals_are_dropped() {
        let (dispatcher, rx) = dispatcher_with_channel();

        dispatcher.notify_raw(-1);
        dispatcher.notify_raw_with_value(99, 3);
        dispatcher.notify_raw(NotificationId::BounceComplete.ordinal());

        assert_eq!(rx.try_recv().unwrap().id(), NotificationId::BounceComplete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notifications_without_observer_are_ignored() {
        let dispatcher = NotificationDispatcher::new(Arc::new(IdleCallbackQueue::new()));
        dispatcher.notify(NotificationId::HardwareUnavailable);
        dispatcher.notify_with_value(NotificationId::RecordedSnippetSaved, 1);
        assert!(!dispatcher.has_observer());
    }

    #[test]
    fn notification_serializes_with_shape_tag() {
        let json = serde_json::to_string(&Notification::WithValue {
            id: NotificationId::RecordedSnippetReady,
            value: 2,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"shape":"with_value","id":"recorded_snippet_ready","value":2}"#
        );
    }
}
