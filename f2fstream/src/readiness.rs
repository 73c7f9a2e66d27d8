//! Single-shot, edge-triggered readiness events.
//!
//! Waiters register with `wait()` and get a `oneshot::Receiver`. Once the
//! event fires every pending receiver completes, and any later `wait()`
//! gets a receiver that is already complete. An event fires once; firing it
//! again is a no-op.

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct EventState {
    fired: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// A condition that becomes true once and stays true.
#[derive(Debug, Default)]
pub struct ReadyEvent {
    state: Mutex<EventState>,
}

impl ReadyEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest. The receiver completes when the event fires, or
    /// immediately if it already has.
    pub fn wait(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut st = self.state.lock();
        if st.fired {
            let _ = tx.send(());
        } else {
            st.waiters.push(tx);
        }
        rx
    }

    /// Fire the event, completing every registered waiter.
    ///
    /// Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let waiters = {
            let mut st = self.state.lock();
            if st.fired {
                return false;
            }
            st.fired = true;
            std::mem::take(&mut st.waiters)
        };
        for waiter in waiters {
            // Receivers dropped by their owners are fine to skip.
            let _ = waiter.send(());
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_complete_on_fire() {
        let event = ReadyEvent::new();
        let mut rx = event.wait();
        assert!(rx.try_recv().is_err());

        assert!(event.fire());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn late_waiter_completes_immediately() {
        let event = ReadyEvent::new();
        event.fire();
        let mut rx = event.wait();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn fires_once() {
        let event = ReadyEvent::new();
        assert!(event.fire());
        assert!(!event.fire());
        assert!(event.is_fired());
    }
}
