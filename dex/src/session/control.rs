//! Per-session control channel
//!
//! One cancellable handle per session: pause is cooperative and only
//! observed at iteration boundaries; cancel is observed at every suspension
//! point. State only moves forward (a cancelled session stays cancelled).

use tokio::sync::watch;

/// Requested control state for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Run,
    Pause,
    Cancel,
}

/// Caller side of the control channel
pub struct SessionControl {
    tx: watch::Sender<ControlState>,
}

impl SessionControl {
    pub fn new() -> (Self, ControlHandle) {
        let (tx, rx) = watch::channel(ControlState::Run);
        (Self { tx }, ControlHandle { rx })
    }

    /// Request a cooperative pause; no-op unless running
    pub fn pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Run {
                *state = ControlState::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Clear a pause request; no-op once cancelled
    pub fn resume(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Pause {
                *state = ControlState::Run;
                true
            } else {
                false
            }
        });
    }

    /// Cancel the session; irreversible
    pub fn cancel(&self) {
        self.tx.send_if_modified(|state| {
            if *state != ControlState::Cancel {
                *state = ControlState::Cancel;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> ControlState {
        *self.tx.borrow()
    }
}

/// Engine side of the control channel
#[derive(Clone)]
pub struct ControlHandle {
    rx: watch::Receiver<ControlState>,
}

impl ControlHandle {
    pub fn current(&self) -> ControlState {
        *self.rx.borrow()
    }

    /// Resolves when the session is cancelled
    ///
    /// A dropped sender counts as cancellation: an orphaned engine must not
    /// keep running.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() == ControlState::Cancel {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_resume() {
        let (control, handle) = SessionControl::new();
        assert_eq!(handle.current(), ControlState::Run);

        control.pause();
        assert_eq!(handle.current(), ControlState::Pause);
        // Pause is idempotent
        control.pause();
        assert_eq!(handle.current(), ControlState::Pause);

        control.resume();
        assert_eq!(handle.current(), ControlState::Run);
    }

    #[tokio::test]
    async fn test_cancel_is_final() {
        let (control, handle) = SessionControl::new();
        control.cancel();
        assert_eq!(handle.current(), ControlState::Cancel);

        control.pause();
        control.resume();
        assert_eq!(handle.current(), ControlState::Cancel);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let (control, mut handle) = SessionControl::new();

        let waiter = tokio::spawn(async move {
            handle.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        control.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_cancel() {
        let (control, mut handle) = SessionControl::new();
        drop(control);
        tokio::time::timeout(Duration::from_secs(1), handle.cancelled()).await.unwrap();
    }
}
