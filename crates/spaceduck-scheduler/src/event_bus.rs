use serde_json::Value;
use tokio::sync::broadcast;

use spaceduck_types::GatewayEvent;

/// Fire-and-forget broadcast bus shared by the scheduler, the queue, and
/// external collaborators. Handlers must not assume ordering across
/// unrelated tasks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, name: &str, payload: Value) {
        self.publish(GatewayEvent::new(name, payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
