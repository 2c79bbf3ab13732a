use tokio::sync::broadcast;

use ctfpilot_orchestrator::AutopilotEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AutopilotEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutopilotEvent> {
        self.tx.subscribe()
    }

    /// Dropped silently when nobody listens.
    pub fn publish(&self, event: AutopilotEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
