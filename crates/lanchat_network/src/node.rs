//! ChatNode — top-level coordinator for the networking layer.
//!
//! [`ChatNode`] is the primary public API for lanchat_network. It owns:
//! - the TCP accept loop (peer connections, one reader task each)
//! - the multicast listener (heartbeats, renames, broadcast chat, typing)
//! - the heartbeat sender
//! - the stale-peer sweeper
//!
//! All four loops share one shutdown signal. [`stop()`](ChatNode::stop)
//! fires it, waits a bounded grace period, then drops every connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{self, Discovery};
use crate::error::NetworkError;
use crate::events::{EventBus, NetworkEvent};
use crate::identity::validate_username;
use crate::message::ChatMessage;
use crate::peer::{PeerInfo, PeerRegistry};
use crate::protocol::Packet;
use crate::router::MessageRouter;
use crate::shutdown::{self, ShutdownTrigger};
use crate::transport::{self, ConnectionManager};

/// Lifecycle of a [`ChatNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    ShuttingDown,
    Stopped,
}

/// Where a typing notification goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingTarget {
    /// Everyone in the multicast group.
    Broadcast,
    /// One peer, over its TCP connection.
    Peer(String),
}

/// Resources that only exist while the node is started.
struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
    connections: ConnectionManager,
    discovery: Option<Discovery>,
    tcp_port: u16,
}

/// One chat participant on the LAN.
///
/// Create one per process. Call [`start()`](ChatNode::start) to begin
/// announcing ourselves and accepting connections.
pub struct ChatNode {
    config: NetworkConfig,
    registry: Arc<PeerRegistry>,
    router: Arc<MessageRouter>,
    events: EventBus,
    state: NodeState,
    running: Option<Running>,
}

impl ChatNode {
    /// Create a node for `username`. Nothing is bound until `start()`.
    pub fn new(username: impl Into<String>, config: NetworkConfig) -> Result<Self, NetworkError> {
        let username = username.into();
        validate_username(&username)?;

        let registry = Arc::new(PeerRegistry::new(username));
        let events = EventBus::new();
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), events.clone()));
        Ok(Self {
            config,
            registry,
            router,
            events,
            state: NodeState::Created,
            running: None,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == NodeState::Started
    }

    /// Subscribe to network events. May be called before `start()`.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn local_username(&self) -> String {
        self.registry.local_name()
    }

    /// TCP port actually bound, after any ephemeral fallback.
    pub fn tcp_port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.tcp_port)
    }

    /// UDP port of the discovery socket, if discovery is running.
    pub fn discovery_port(&self) -> Option<u16> {
        self.running
            .as_ref()
            .and_then(|r| r.discovery.as_ref())
            .and_then(Discovery::local_port)
    }

    /// Bind sockets, launch the background loops and register ourselves.
    ///
    /// Calling `start()` on a started node is a no-op. A multicast socket
    /// that cannot be bound disables discovery instead of failing.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.state == NodeState::Started {
            return Ok(());
        }
        self.config.validate()?;

        let listener = transport::bind_listener(self.config.tcp_port).await?;
        let tcp_port = listener.local_addr()?.port();

        let (trigger, shutdown) = shutdown::channel();
        let connections = ConnectionManager::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.router),
            self.events.clone(),
            self.config.connect_timeout,
            self.config.dedup_capacity,
            shutdown.clone(),
        );

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(connections.clone().accept_loop(listener)));

        let discovery = if self.config.discovery_enabled {
            self.start_discovery(tcp_port, &trigger, &mut tasks)
        } else {
            info!("Multicast discovery disabled by config");
            None
        };

        self.registry
            .register_local(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), tcp_port));

        self.running = Some(Running {
            trigger,
            tasks,
            connections,
            discovery,
            tcp_port,
        });
        self.state = NodeState::Started;
        info!(
            "ChatNode '{}' started (tcp port {tcp_port})",
            self.registry.local_name()
        );
        Ok(())
    }

    fn start_discovery(
        &self,
        tcp_port: u16,
        trigger: &ShutdownTrigger,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Option<Discovery> {
        let group = self.config.multicast_group;
        let socket = match discovery::bind_multicast(group, self.config.multicast_port) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("Discovery start failed (non-fatal): {e}");
                return None;
            }
        };
        let port = socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.multicast_port);
        let target = SocketAddr::new(group.into(), port);

        let discovery = Discovery::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.router),
            self.events.clone(),
            socket,
            target,
        );
        tasks.push(tokio::spawn(
            discovery.clone().listen_loop(trigger.subscribe()),
        ));
        tasks.push(tokio::spawn(discovery.clone().heartbeat_loop(
            self.config.heartbeat_interval,
            tcp_port,
            trigger.subscribe(),
        )));
        tasks.push(tokio::spawn(discovery.clone().sweep_loop(
            self.config.sweep_interval,
            self.config.peer_timeout,
            trigger.subscribe(),
        )));
        Some(discovery)
    }

    /// Stop every loop and drop every connection.
    ///
    /// Idempotent, and safe to call on a node that was never started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            if self.state != NodeState::Created {
                self.state = NodeState::Stopped;
            }
            return;
        };
        self.state = NodeState::ShuttingDown;

        let Running {
            trigger,
            tasks,
            connections,
            discovery,
            ..
        } = running;
        trigger.trigger();

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background loops did not exit within {grace:?}, aborting");
            for handle in aborts {
                handle.abort();
            }
        }

        // Releases the UDP socket once the loops have let go of it.
        drop(discovery);
        drop(connections);
        let dropped = self.registry.clear();
        debug!("Dropped {} registry entries", dropped.len());

        self.state = NodeState::Stopped;
        info!("ChatNode '{}' stopped", self.registry.local_name());
    }

    fn running(&self) -> Result<&Running, NetworkError> {
        self.running.as_ref().ok_or(NetworkError::NotRunning)
    }

    fn multicast(&self) -> Result<&Discovery, NetworkError> {
        self.running()?
            .discovery
            .as_ref()
            .ok_or_else(|| NetworkError::Discovery("multicast discovery is not running".into()))
    }

    /// Multicast a chat message to every peer in the group.
    pub async fn send_broadcast(&self, content: &str) -> Result<ChatMessage, NetworkError> {
        let discovery = self.multicast()?;
        let message = ChatMessage::outgoing(self.registry.local_name(), content);
        discovery
            .send_packet(&Packet::Broadcast {
                sender: message.sender_name.clone(),
                message_id: message.id,
                content: message.content.clone(),
            })
            .await?;
        Ok(message)
    }

    /// Send a private message to `name`, connecting first if needed.
    ///
    /// Fails with `PeerNotFound` for unknown names (and our own), and with
    /// `PeerUnreachable` when the connection cannot be made; in the latter
    /// case the peer is evicted until its next heartbeat.
    pub async fn send_to_peer(&self, name: &str, content: &str) -> Result<ChatMessage, NetworkError> {
        let running = self.running()?;
        let message = ChatMessage::outgoing(self.registry.local_name(), content);
        running
            .connections
            .send_to(
                name,
                &Packet::Chat {
                    sender: message.sender_name.clone(),
                    message_id: message.id,
                    content: message.content.clone(),
                },
            )
            .await?;
        Ok(message)
    }

    pub async fn send_typing_status(&self, is_typing: bool, target: TypingTarget) -> Result<(), NetworkError> {
        let packet = Packet::Typing {
            sender: self.registry.local_name(),
            is_typing,
        };
        match target {
            TypingTarget::Broadcast => self.multicast()?.send_packet(&packet).await,
            TypingTarget::Peer(name) => self.running()?.connections.send_to(&name, &packet).await,
        }
    }

    /// Rename the local user, keeping the local entry's timestamp.
    ///
    /// While started, peers are told with a `NAME_UPDATE`; a failed
    /// announcement is logged and the next heartbeat carries the new name.
    pub async fn rename_local_user(&self, new_name: &str) -> Result<(), NetworkError> {
        validate_username(new_name)?;
        let old_name = self.registry.rename_local(new_name)?;
        if old_name == new_name {
            return Ok(());
        }
        info!("Local user renamed from {old_name} to {new_name}");

        if let Some(discovery) = self.running.as_ref().and_then(|r| r.discovery.as_ref()) {
            let update = Packet::NameUpdate {
                old_name,
                new_name: new_name.to_string(),
            };
            if let Err(e) = discovery.send_packet(&update).await {
                warn!("Rename announcement failed: {e}");
            }
        }
        Ok(())
    }

    /// Names of known remote peers, sorted.
    pub fn list_active_peers(&self) -> Vec<String> {
        self.registry
            .active_peers()
            .into_iter()
            .map(|p| p.username)
            .collect()
    }

    /// Point-in-time copy of every registry entry, including our own.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
