//! Sandbox event sink: the `event` notification stream the RPC layer
//! forwards to the client.
//!
//! A `tokio::sync::broadcast` channel rather than an mpsc, so the RPC
//! handler can subscribe for the lifetime of one `create` call without
//! the sandbox needing to know how many listeners exist; a sandbox with
//! no RPC subscriber just drops events on the floor (`send` failing is
//! not an error here).

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct SandboxEvent {
    pub kind: String,
    pub detail: serde_json::Value,
}

#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SandboxEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, kind: impl Into<String>, detail: serde_json::Value) {
        let _ = self.tx.send(SandboxEvent {
            kind: kind.into(),
            detail,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_emitted_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit("vfs_hook", serde_json::json!({"path": "/a"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "vfs_hook");
    }

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let sink = EventSink::new();
        sink.emit("policy_denied", serde_json::json!({"host": "evil.com"}));
    }
}
