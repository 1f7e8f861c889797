//! Message router — dispatches inbound payloads by type.
//!
//! TCP frames are routed with a [`SessionState`] owned by the connection's
//! reader task. The session carries the connection's dedup window and the
//! peer identity learned from HELLO or CHAT; it is dropped with the task.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::events::{EventBus, NetworkEvent};
use crate::identity::MessageId;
use crate::message::ChatMessage;
use crate::peer::{Attach, PeerRegistry};
use crate::protocol::Packet;
use crate::transport::PeerConnection;

/// Bounded set of recently seen message IDs.
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

/// Per-connection state, owned by the connection's reader task.
#[derive(Debug)]
pub struct SessionState {
    remote_addr: SocketAddr,
    peer: Option<String>,
    seen: DedupWindow,
}

impl SessionState {
    /// State for an accepted connection whose peer is not yet known.
    pub fn inbound(remote_addr: SocketAddr, dedup_capacity: usize) -> Self {
        Self {
            remote_addr,
            peer: None,
            seen: DedupWindow::new(dedup_capacity),
        }
    }

    /// State for a connection we opened to a known peer.
    pub fn outbound(remote_addr: SocketAddr, peer: impl Into<String>, dedup_capacity: usize) -> Self {
        Self {
            remote_addr,
            peer: Some(peer.into()),
            seen: DedupWindow::new(dedup_capacity),
        }
    }

    /// The peer this connection has been associated with, if any.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}

/// Routes decoded packets to the registry and the event bus.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Arc<PeerRegistry>,
    events: EventBus,
}

impl MessageRouter {
    pub fn new(registry: Arc<PeerRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// Route a multicast payload. Broadcasts are not deduplicated.
    pub fn route_datagram(&self, packet: Packet, source: SocketAddr) {
        match packet {
            Packet::Broadcast {
                sender,
                message_id,
                content,
            } => {
                if self.registry.is_local_name(&sender) {
                    trace!("Ignoring own broadcast {message_id}");
                    return;
                }
                trace!("Broadcast {message_id} from {sender} at {source}");
                self.events.emit(NetworkEvent::MessageReceived(ChatMessage::incoming(
                    message_id, sender, content,
                )));
            }
            Packet::Typing { sender, is_typing } => self.typing(sender, is_typing),
            other => trace!("Ignoring {} datagram from {source}", other.tag()),
        }
    }

    /// Route one TCP frame received on `connection`.
    pub fn route_frame(
        &self,
        session: &mut SessionState,
        packet: Packet,
        connection: &Arc<PeerConnection>,
    ) {
        match packet {
            Packet::Chat {
                sender,
                message_id,
                content,
            } => {
                if !session.seen.insert(message_id) {
                    debug!(
                        "Dropping duplicate message {message_id} from {} ({} ids remembered)",
                        session.remote_addr,
                        session.seen.len()
                    );
                    return;
                }
                self.bind_sender(session, &sender, connection);
                self.events.emit(NetworkEvent::MessageReceived(ChatMessage::incoming(
                    message_id, sender, content,
                )));
            }
            Packet::Hello { sender } => self.hello(session, sender, connection),
            Packet::Typing { sender, is_typing } => self.typing(sender, is_typing),
            other => debug!(
                "Ignoring {} frame from {}",
                other.tag(),
                session.remote_addr
            ),
        }
    }

    fn typing(&self, sender: String, is_typing: bool) {
        if self.registry.is_local_name(&sender) {
            return;
        }
        self.events.emit(NetworkEvent::TypingStatusReceived {
            name: sender,
            is_typing,
        });
    }

    fn hello(&self, session: &mut SessionState, sender: String, connection: &Arc<PeerConnection>) {
        let Some(assoc) = self
            .registry
            .associate(&sender, session.remote_addr, connection)
        else {
            warn!(
                "Peer at {} sent HELLO with our own name {sender:?}",
                session.remote_addr
            );
            return;
        };

        debug!(
            "HELLO from {sender} at {} (attached: {})",
            session.remote_addr, assoc.attached
        );
        if let Some(peer) = assoc.discovered {
            info!("Peer {sender} discovered via HELLO from {}", session.remote_addr);
            self.events.emit(NetworkEvent::PeerDiscovered {
                name: sender.clone(),
                endpoint: peer.endpoint,
            });
        }
        session.peer = Some(sender);
    }

    fn bind_sender(&self, session: &mut SessionState, sender: &str, connection: &Arc<PeerConnection>) {
        if session.peer.as_deref() == Some(sender) {
            return;
        }
        match self.registry.attach_connection(sender, connection) {
            Attach::Attached => debug!("Associated {} with {sender}", session.remote_addr),
            Attach::Existing(_) => trace!("{sender} already has a connection"),
            Attach::Unknown => debug!(
                "CHAT from unregistered peer {sender} at {}",
                session.remote_addr
            ),
        }
        session.peer = Some(sender.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
