//! The engine event stream and the opt-in diagnostic ring.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use dna_store::models::MessageStatus;

/// A decrypted message as surfaced to consumers.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub id: String,
    /// Hex sender fingerprint.
    pub sender: String,
    /// Hex recipient fingerprint or group uuid.
    pub recipient: String,
    pub plaintext: String,
    /// Sender-side timestamp from the envelope.
    pub timestamp: u64,
    pub group_uuid: Option<String>,
    /// False while sender-signature verification is deferred.
    pub verified: bool,
    /// PENDING | SENT | RECEIVED | FAILED.
    pub status: String,
}

/// Tagged-union notifications pushed to the registered handler(s).
#[derive(Debug, Clone)]
pub enum Event {
    DhtConnected,
    DhtDisconnected,
    MessageReceived { message: MessageView },
    MessageStatusChanged { id: String, new_status: MessageStatus },
    ContactOnline { fingerprint: String },
    ContactOffline { fingerprint: String },
    GroupInvitationReceived { group_uuid: String, group_name: String, from: String },
    IdentityLoaded { fingerprint: String },
    Error { code: String, message: String },
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out; slow subscribers lose oldest events rather than
/// blocking the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEBUG_RING_CAPACITY: usize = 200;

/// Opt-in bounded diagnostic buffer. Entries must never contain key
/// material, seeds, or message bodies.
pub struct DebugRing {
    enabled: bool,
    entries: Mutex<VecDeque<String>>,
}

impl DebugRing {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, entries: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, line: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == DEBUG_RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::DhtConnected);
        assert!(matches!(rx.recv().await.unwrap(), Event::DhtConnected));
    }

    #[test]
    fn ring_caps_at_capacity() {
        let ring = DebugRing::new(true);
        for i in 0..DEBUG_RING_CAPACITY + 50 {
            ring.push(format!("line {i}"));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), DEBUG_RING_CAPACITY);
        assert_eq!(snapshot[0], "line 50");
    }

    #[test]
    fn disabled_ring_stays_empty() {
        let ring = DebugRing::new(false);
        ring.push("ignored");
        assert!(ring.snapshot().is_empty());
    }
}
