//! LAN peer discovery via UDP multicast.
//!
//! One socket, joined to the multicast group, carries heartbeats, name
//! updates, broadcast chat and typing status. Three loops run against it:
//! the heartbeat sender, the datagram listener and the stale-peer sweeper.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::events::{EventBus, NetworkEvent};
use crate::peer::{PeerRegistry, Rekey, Upsert};
use crate::protocol::{self, MAX_DATAGRAM_LEN, Packet};
use crate::router::MessageRouter;
use crate::shutdown::Shutdown;

/// Pause after a failed receive before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Pause after a failed heartbeat send.
const SEND_BACKOFF: Duration = Duration::from_secs(1);

/// Bind a UDP socket on `port` and join `group` on the default interface.
///
/// The address is shared so several nodes on one host can listen on the
/// same group port. A failed group join leaves a unicast-only socket.
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

    match socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
        Ok(()) => {
            if let Err(e) = socket.set_multicast_loop_v4(true) {
                debug!("Multicast loopback unavailable: {e}");
            }
        }
        Err(e) => warn!("Failed to join multicast group {group}: {e}"),
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// The multicast side of a running node.
#[derive(Debug, Clone)]
pub struct Discovery {
    registry: Arc<PeerRegistry>,
    router: Arc<MessageRouter>,
    events: EventBus,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl Discovery {
    pub fn new(
        registry: Arc<PeerRegistry>,
        router: Arc<MessageRouter>,
        events: EventBus,
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    ) -> Self {
        Self {
            registry,
            router,
            events,
            socket,
            target,
        }
    }

    /// Port the socket actually bound.
    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|a| a.port())
    }

    /// Send one packet to the group.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), NetworkError> {
        let payload = packet.encode();
        self.socket
            .send_to(payload.as_bytes(), self.target)
            .await
            .map_err(|e| NetworkError::Discovery(format!("Send {} failed: {e}", packet.tag())))?;
        trace!("Sent {} datagram to {}", packet.tag(), self.target);
        Ok(())
    }

    /// Announce ourselves every `interval` until shutdown.
    ///
    /// The local name is read on every tick so a rename shows up in the
    /// next heartbeat.
    pub async fn heartbeat_loop(self, interval: Duration, tcp_port: u16, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let heartbeat = Packet::Heartbeat {
                        sender: self.registry.local_name(),
                        tcp_port,
                    };
                    if let Err(e) = self.send_packet(&heartbeat).await {
                        warn!("{e}");
                        tokio::select! {
                            _ = tokio::time::sleep(SEND_BACKOFF) => {}
                            _ = shutdown.wait() => break,
                        }
                    }
                }
                _ = shutdown.wait() => {
                    debug!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    /// Receive datagrams until shutdown.
    pub async fn listen_loop(self, mut shutdown: Shutdown) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        if let Some(port) = self.local_port() {
            info!("Discovery listening on UDP port {port} (group {})", self.target);
        }

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                    Err(e) => {
                        warn!("Discovery recv error: {e}");
                        tokio::time::sleep(RECV_BACKOFF).await;
                    }
                },
                _ = shutdown.wait() => {
                    debug!("Discovery listener shutting down");
                    break;
                }
            }
        }
    }

    /// Evict silent peers every `interval` until shutdown.
    pub async fn sweep_loop(self, interval: Duration, timeout: Duration, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(Instant::now(), timeout),
                _ = shutdown.wait() => {
                    debug!("Sweep loop shutting down");
                    break;
                }
            }
        }
    }

    fn sweep(&self, now: Instant, timeout: Duration) {
        for peer in self.registry.evict_stale(now, timeout) {
            info!("Peer {} timed out at {}", peer.username, peer.endpoint);
            self.events.emit(NetworkEvent::PeerDisconnected {
                name: peer.username,
                endpoint: peer.endpoint,
            });
        }
    }

    fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) {
        let packet = match protocol::decode_datagram(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Skipping datagram from {source}: {e}");
                return;
            }
        };

        match packet {
            Packet::Heartbeat { sender, tcp_port } => self.handle_heartbeat(&sender, tcp_port, source),
            Packet::NameUpdate { old_name, new_name } => {
                self.handle_name_update(&old_name, &new_name, source)
            }
            other => self.router.route_datagram(other, source),
        }
    }

    fn handle_heartbeat(&self, sender: &str, tcp_port: u16, source: SocketAddr) {
        let endpoint = SocketAddr::new(source.ip(), tcp_port);
        match self.registry.upsert(sender, endpoint, false) {
            Upsert::Inserted(peer) => {
                info!("Discovered peer {} at {}", peer.username, peer.endpoint);
                self.events.emit(NetworkEvent::PeerDiscovered {
                    name: peer.username,
                    endpoint: peer.endpoint,
                });
            }
            Upsert::EndpointChanged { peer, previous } => {
                info!("Peer {} moved from {previous} to {}", peer.username, peer.endpoint);
            }
            Upsert::Refreshed(_) => trace!("Heartbeat from {sender} at {endpoint}"),
            Upsert::Rejected => trace!("Ignoring heartbeat carrying our own name"),
        }
    }

    fn handle_name_update(&self, old_name: &str, new_name: &str, source: SocketAddr) {
        match self.registry.rekey(old_name, new_name) {
            Rekey::Renamed(peer) => {
                info!("Peer {old_name} is now {new_name}");
                self.events.emit(NetworkEvent::PeerDisconnected {
                    name: old_name.to_string(),
                    endpoint: peer.endpoint,
                });
                self.events.emit(NetworkEvent::PeerDiscovered {
                    name: peer.username,
                    endpoint: peer.endpoint,
                });
            }
            Rekey::Merged { removed, peer } => {
                info!("Peer {old_name} is now {new_name} (already known)");
                self.events.emit(NetworkEvent::PeerDisconnected {
                    name: removed.username,
                    endpoint: removed.endpoint,
                });
                trace!("{} keeps endpoint {}", peer.username, peer.endpoint);
            }
            Rekey::Missing => {
                // Port is learned from the next heartbeat.
                let endpoint = SocketAddr::new(source.ip(), 0);
                if let Some(peer) = self.registry.insert_if_absent(new_name, endpoint) {
                    info!("Discovered peer {new_name} via rename from unknown {old_name}");
                    self.events.emit(NetworkEvent::PeerDiscovered {
                        name: peer.username,
                        endpoint: peer.endpoint,
                    });
                }
            }
            Rekey::Conflict => {
                warn!("Ignoring rename {old_name} -> {new_name}: our own name");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MessageId;
    use crate::shutdown;
    use tokio::sync::broadcast;

    struct Harness {
        registry: Arc<PeerRegistry>,
        discovery: Discovery,
        events: broadcast::Receiver<NetworkEvent>,
    }

    async fn harness(local: &str) -> Harness {
        let registry = Arc::new(PeerRegistry::new(local));
        registry.register_local("127.0.0.1:0".parse().unwrap());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), bus.clone()));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let target = socket.local_addr().unwrap();
        let discovery = Discovery::new(Arc::clone(&registry), router, bus, socket, target);
        Harness {
            registry,
            discovery,
            events,
        }
    }

    fn source() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    fn next_event(rx: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
        rx.try_recv().expect("pending event")
    }

    #[tokio::test]
    async fn test_heartbeat_discovers_then_refreshes() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());

        match next_event(&mut h.events) {
            NetworkEvent::PeerDiscovered { name, endpoint } => {
                assert_eq!(name, "bob");
                assert_eq!(endpoint, "10.0.0.7:14000".parse::<SocketAddr>().unwrap());
            }
            other => panic!("Unexpected event {other:?}"),
        }

        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.registry.active_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_own_heartbeat_ignored() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:alice:14000", source());
        assert!(h.events.try_recv().is_err());
        assert!(h.registry.get("alice").unwrap().is_local);
    }

    #[tokio::test]
    async fn test_heartbeat_with_nul_padding_and_garbage() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:carol:15000\0\0\0", source());
        assert!(matches!(
            next_event(&mut h.events),
            NetworkEvent::PeerDiscovered { .. }
        ));

        h.discovery.handle_datagram(b"HEARTBEAT:dave:notaport", source());
        h.discovery.handle_datagram(b"PING:dave", source());
        assert!(h.events.try_recv().is_err());
        assert!(h.registry.get("dave").is_none());
    }

    #[tokio::test]
    async fn test_name_update_rekeys_and_emits_pair() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());
        let _ = next_event(&mut h.events);
        let before = h.registry.get("bob").unwrap().last_heartbeat;

        h.discovery.handle_datagram(b"NAME_UPDATE:bob:robert", source());

        match next_event(&mut h.events) {
            NetworkEvent::PeerDisconnected { name, .. } => assert_eq!(name, "bob"),
            other => panic!("Unexpected event {other:?}"),
        }
        match next_event(&mut h.events) {
            NetworkEvent::PeerDiscovered { name, .. } => assert_eq!(name, "robert"),
            other => panic!("Unexpected event {other:?}"),
        }
        assert!(h.registry.get("bob").is_none());
        assert_eq!(h.registry.get("robert").unwrap().last_heartbeat, before);
    }

    #[tokio::test]
    async fn test_name_update_from_unknown_is_discovery() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"NAME_UPDATE:ghost:casper", source());

        match next_event(&mut h.events) {
            NetworkEvent::PeerDiscovered { name, endpoint } => {
                assert_eq!(name, "casper");
                assert_eq!(endpoint.port(), 0);
            }
            other => panic!("Unexpected event {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_name_update_after_new_heartbeat_drops_old_entry() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());
        h.discovery.handle_datagram(b"HEARTBEAT:robert:14000", source());
        let _ = next_event(&mut h.events);
        let _ = next_event(&mut h.events);

        h.discovery.handle_datagram(b"NAME_UPDATE:bob:robert", source());

        match next_event(&mut h.events) {
            NetworkEvent::PeerDisconnected { name, .. } => assert_eq!(name, "bob"),
            other => panic!("Unexpected event {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
        let names: Vec<String> = h
            .registry
            .active_peers()
            .into_iter()
            .map(|p| p.username)
            .collect();
        assert_eq!(names, vec!["robert"]);
    }

    #[tokio::test]
    async fn test_name_update_onto_known_name_from_unknown_is_quiet() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:robert:14000", source());
        let _ = next_event(&mut h.events);

        h.discovery.handle_datagram(b"NAME_UPDATE:bob:robert", source());
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.registry.get("robert").unwrap().endpoint.port(), 14000);
    }

    #[tokio::test]
    async fn test_name_update_involving_local_name_is_ignored() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());
        let _ = next_event(&mut h.events);

        h.discovery.handle_datagram(b"NAME_UPDATE:bob:alice", source());
        h.discovery.handle_datagram(b"NAME_UPDATE:alice:mallory", source());
        assert!(h.events.try_recv().is_err());
        assert!(h.registry.get("bob").is_some());
        assert!(h.registry.get("alice").unwrap().is_local);
        assert!(h.registry.get("mallory").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_and_typing_reach_events() {
        let mut h = harness("alice").await;
        let id = MessageId::generate();
        let payload = format!("BROADCAST:bob:{id}:hello: world");
        h.discovery.handle_datagram(payload.as_bytes(), source());

        match next_event(&mut h.events) {
            NetworkEvent::MessageReceived(msg) => {
                assert_eq!(msg.id, id);
                assert_eq!(msg.sender_name, "bob");
                assert_eq!(msg.content, "hello: world");
                assert!(!msg.is_mine);
            }
            other => panic!("Unexpected event {other:?}"),
        }

        h.discovery.handle_datagram(b"TYPING_STOP:bob", source());
        match next_event(&mut h.events) {
            NetworkEvent::TypingStatusReceived { name, is_typing } => {
                assert_eq!(name, "bob");
                assert!(!is_typing);
            }
            other => panic!("Unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_peers() {
        let mut h = harness("alice").await;
        h.discovery.handle_datagram(b"HEARTBEAT:bob:14000", source());
        let _ = next_event(&mut h.events);

        let later = Instant::now() + Duration::from_secs(16);
        h.discovery.sweep(later, Duration::from_secs(15));

        match next_event(&mut h.events) {
            NetworkEvent::PeerDisconnected { name, .. } => assert_eq!(name, "bob"),
            other => panic!("Unexpected event {other:?}"),
        }
        assert!(h.registry.get("bob").is_none());
        assert!(h.registry.get("alice").is_some());
    }

    #[tokio::test]
    async fn test_listen_loop_receives_and_stops() {
        let mut h = harness("alice").await;
        let target = h.discovery.target;
        let (trigger, shutdown) = shutdown::channel();
        let listener = tokio::spawn(h.discovery.clone().listen_loop(shutdown));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"HEARTBEAT:bob:14000", target).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            NetworkEvent::PeerDiscovered { name, endpoint } => {
                assert_eq!(name, "bob");
                assert_eq!(endpoint, "127.0.0.1:14000".parse::<SocketAddr>().unwrap());
            }
            other => panic!("Unexpected event {other:?}"),
        }

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_loop_announces_current_name() {
        let h = harness("alice").await;
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery = Discovery {
            target: probe.local_addr().unwrap(),
            ..h.discovery.clone()
        };
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(discovery.heartbeat_loop(Duration::from_millis(50), 14000, shutdown));

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), probe.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"HEARTBEAT:alice:14000");

        h.registry.rename_local("alicia").unwrap();
        let renamed = loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(1), probe.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if &buf[..len] != b"HEARTBEAT:alice:14000" {
                break buf[..len].to_vec();
            }
        };
        assert_eq!(renamed, b"HEARTBEAT:alicia:14000");

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_multicast_ephemeral() {
        let socket = bind_multicast(Ipv4Addr::new(239, 255, 0, 1), 0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
