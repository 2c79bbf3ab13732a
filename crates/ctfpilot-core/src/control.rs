use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cooperative pause/cancel switches shared between the host and a run task.
/// Neither switch interrupts work already in flight.
#[derive(Clone, Debug)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    /// Returns false when already paused or cancelled.
    pub fn pause(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.paused.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    pub fn resume(&self) -> bool {
        self.paused.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        // wake anything parked on the pause gate
        self.paused.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Parks until resumed. Returns false if the run was cancelled.
    pub async fn wait_if_paused(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            resumed = rx.wait_for(|paused| !*paused) => {
                let resumed = resumed.is_ok();
                resumed && !self.is_cancelled()
            }
        }
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
