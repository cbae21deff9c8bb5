use parking_lot::{Condvar, Mutex};

/// Cooperative parking spot for the render thread.
///
/// Any thread may flip the pause flag; only the render thread waits on it.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    unparked: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        *self.paused.lock() = true;
    }

    /// Clears the pause flag and wakes the parked render thread, if any.
    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.unparked.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Blocks for as long as the pause flag is set. There is no timeout: only
    /// [`PauseGate::resume`] unparks the caller.
    pub fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        // spurious wakeups re-check the predicate
        while *paused {
            self.unparked.wait(&mut paused);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn returns_immediately_when_not_paused() {
        let gate = PauseGate::new();
        gate.wait_while_paused();
        assert!(!gate.is_paused());
    }

    #[test]
    fn parks_until_resumed() {
        let gate = Arc::new(PauseGate::new());
        gate.request_pause();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.wait_while_paused();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        gate.resume();
        rx.recv_timeout(Duration::from_secs(2))
            .expect("waiter should be released by resume");
        waiter.join().unwrap();
    }

    #[test]
    fn pause_then_resume_from_same_thread_is_ordered() {
        let gate = PauseGate::new();
        gate.request_pause();
        gate.resume();
        assert!(!gate.is_paused());
        gate.request_pause();
        assert!(gate.is_paused());
    }
}
