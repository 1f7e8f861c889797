//! Events raised to the consuming layer.

use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;

use crate::message::ChatMessage;

/// Capacity of the event channel before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the networking layer wants the consuming layer to know.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer became visible (new heartbeat, HELLO, or the new half of a rename).
    PeerDiscovered { name: String, endpoint: SocketAddr },
    /// A peer went away (timeout, send failure, or the old half of a rename).
    PeerDisconnected { name: String, endpoint: SocketAddr },
    /// A chat message arrived from another peer.
    MessageReceived(ChatMessage),
    /// A peer started or stopped typing.
    TypingStatusReceived { name: String, is_typing: bool },
}

/// Fan-out of [`NetworkEvent`]s to any number of subscribers.
///
/// Emitting never blocks, so it is safe from inside network loops.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: NetworkEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(NetworkEvent::TypingStatusReceived {
            name: "nobody".to_string(),
            is_typing: true,
        });
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(NetworkEvent::PeerDiscovered {
            name: "alice".to_string(),
            endpoint: "10.0.0.2:14000".parse().unwrap(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                NetworkEvent::PeerDiscovered { name, .. } => assert_eq!(name, "alice"),
                other => panic!("Unexpected event {other:?}"),
            }
        }
    }
}
