use crossbeam_channel::{unbounded, Receiver, Sender};

/// Deferred action executed once the engine reports it is idle.
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

/// What happened to an action handed to [`IdleCallbackQueue::run_when_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDisposition {
    /// The sequencer was not playing so the action ran on the caller's thread.
    RanImmediately,
    /// The action is queued until the next idle notification.
    Deferred,
}

/// FIFO of actions that may only run between render buffers.
pub struct IdleCallbackQueue {
    tx: Sender<IdleCallback>,
    rx: Receiver<IdleCallback>,
}

impl Default for IdleCallbackQueue {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl IdleCallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` right away when `playing` is false, otherwise queues it.
    ///
    /// The caller is responsible for asking the native layer to emit an idle
    /// notification when the action was deferred.
    pub fn run_when_idle<F>(&self, playing: bool, action: F) -> IdleDisposition
    where
        F: FnOnce() + Send + 'static,
    {
        if !playing {
            action();
            return IdleDisposition::RanImmediately;
        }
        // both ends live in `self`, so the channel cannot be disconnected
        let _ = self.tx.send(Box::new(action));
        IdleDisposition::Deferred
    }

    /// Invokes every action that was queued when the drain started, in
    /// insertion order, and returns how many ran. Actions queued by those
    /// actions wait for the next drain.
    pub fn drain(&self) -> usize {
        let pending = self.rx.len();
        let mut executed = 0;
        for callback in self.rx.try_iter().take(pending) {
            callback();
            executed += 1;
        }
        executed
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drops pending actions without running them.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl std::fmt::Debug for IdleCallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleCallbackQueue")
            .field("pending", &self.len())
            .finish()
    }
}
