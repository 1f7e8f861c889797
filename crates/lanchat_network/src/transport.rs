//! TCP transport — peer connections, the accept loop and reader tasks.
//!
//! Every connection, accepted or opened, gets one reader task that decodes
//! frames and hands them to the [`MessageRouter`]. The write half lives in a
//! [`PeerConnection`] that the registry stores against the peer. At most one
//! connection is attached per peer; the registry decides which one wins.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::events::{EventBus, NetworkEvent};
use crate::peer::{Attach, PeerInfo, PeerRegistry};
use crate::protocol::{self, Packet};
use crate::router::{MessageRouter, SessionState};
use crate::shutdown::Shutdown;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Write handle of a TCP connection to a peer.
///
/// Cloned as `Arc<PeerConnection>` between the registry and the reader task.
/// [`close`](PeerConnection::close) stops the reader, which drops the read
/// half; the socket is released once the last handle goes away.
pub struct PeerConnection {
    id: u64,
    remote_addr: SocketAddr,
    direction: Direction,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new(remote_addr: SocketAddr, direction: Direction, writer: OwnedWriteHalf) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            direction,
            writer: Mutex::new(writer),
            closed,
        })
    }

    /// Process-unique connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Send one framed packet.
    pub async fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionReset(self.remote_addr));
        }
        let mut writer = self.writer.lock().await;
        match protocol::write_frame(&mut *writer, packet).await {
            Ok(()) => {}
            // Nothing was written; the connection is still usable.
            Err(e @ NetworkError::FrameTooLarge { .. }) => return Err(e),
            Err(e) => {
                debug!("Write to {} failed: {e}", self.remote_addr);
                self.close();
                return Err(NetworkError::ConnectionReset(self.remote_addr));
            }
        }
        trace!("Sent {} frame to {}", packet.tag(), self.remote_addr);
        Ok(())
    }

    /// Mark the connection closed and stop its reader.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Closing connection {} to {}", self.id, self.remote_addr);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Bind the TCP service listener, falling back to an ephemeral port when
/// the requested one is taken.
pub async fn bind_listener(port: u16) -> Result<TcpListener, NetworkError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && port != 0 => {
            warn!("{}, falling back to an ephemeral port", NetworkError::AddressInUse(addr));
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
            Ok(listener)
        }
        Err(e) => Err(e.into()),
    }
}

/// Opens, reuses and tears down per-peer TCP connections.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    registry: Arc<PeerRegistry>,
    router: Arc<MessageRouter>,
    events: EventBus,
    connect_timeout: Duration,
    dedup_capacity: usize,
    shutdown: Shutdown,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<PeerRegistry>,
        router: Arc<MessageRouter>,
        events: EventBus,
        connect_timeout: Duration,
        dedup_capacity: usize,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            registry,
            router,
            events,
            connect_timeout,
            dedup_capacity,
            shutdown,
        }
    }

    /// Return the peer's open connection, opening one if needed.
    ///
    /// Concurrent callers may both dial; the first connection attached to the
    /// registry wins and the other is closed.
    pub async fn ensure_connected(&self, peer: &PeerInfo) -> Result<Arc<PeerConnection>, NetworkError> {
        let current = self
            .registry
            .get(&peer.username)
            .filter(|p| !p.is_local)
            .ok_or_else(|| NetworkError::PeerNotFound(peer.username.clone()))?;
        if let Some(conn) = current.open_connection() {
            return Ok(Arc::clone(conn));
        }

        let conn = self.open(&current).await?;
        match self.registry.attach_connection(&current.username, &conn) {
            Attach::Attached => {
                info!("Connected to {} at {}", current.username, current.endpoint);
                Ok(conn)
            }
            Attach::Existing(existing) => {
                debug!(
                    "Another connection to {} won, closing duplicate",
                    current.username
                );
                conn.close();
                Ok(existing)
            }
            Attach::Unknown => {
                conn.close();
                Err(NetworkError::PeerNotFound(current.username))
            }
        }
    }

    /// Dial the peer, send HELLO and start the reader.
    async fn open(&self, peer: &PeerInfo) -> Result<Arc<PeerConnection>, NetworkError> {
        let unreachable = || NetworkError::PeerUnreachable {
            name: peer.username.clone(),
            endpoint: peer.endpoint,
        };
        if peer.endpoint.port() == 0 {
            debug!("Service port of {} not known yet", peer.username);
            return Err(unreachable());
        }

        debug!("Connecting to {} at {}", peer.username, peer.endpoint);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {e}", peer.endpoint);
                return Err(unreachable());
            }
            Err(_) => {
                debug!(
                    "Connect to {} timed out after {:?}",
                    peer.endpoint, self.connect_timeout
                );
                return Err(unreachable());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let conn = PeerConnection::new(peer.endpoint, Direction::Outbound, write_half);
        let hello = Packet::Hello {
            sender: self.registry.local_name(),
        };
        match tokio::time::timeout(self.connect_timeout, conn.send(&hello)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("HELLO to {} failed: {e}", peer.username);
                conn.close();
                return Err(unreachable());
            }
            Err(_) => {
                debug!("HELLO to {} timed out", peer.username);
                conn.close();
                return Err(unreachable());
            }
        }

        let session = SessionState::outbound(peer.endpoint, peer.username.clone(), self.dedup_capacity);
        self.spawn_reader(Arc::clone(&conn), read_half, session);
        Ok(conn)
    }

    /// Send `packet` to the named peer, connecting first if needed.
    ///
    /// Any connect or write failure evicts the peer and raises
    /// `PeerDisconnected`; there is no retry. An oversized packet is
    /// refused without touching the peer.
    pub async fn send_to(&self, name: &str, packet: &Packet) -> Result<(), NetworkError> {
        let peer = self
            .registry
            .get(name)
            .filter(|p| !p.is_local)
            .ok_or_else(|| NetworkError::PeerNotFound(name.to_string()))?;

        let conn = match self.ensure_connected(&peer).await {
            Ok(conn) => conn,
            Err(e @ NetworkError::PeerUnreachable { .. }) => {
                warn!("{e}");
                self.mark_disconnected(name);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let result = match tokio::time::timeout(self.connect_timeout, conn.send(packet)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.connect_timeout)),
        };
        if let Err(e @ NetworkError::FrameTooLarge { .. }) = result {
            return Err(e);
        }
        if let Err(e) = result {
            warn!("Send to {name} failed: {e}");
            conn.close();
            self.mark_disconnected(name);
            return Err(e);
        }
        Ok(())
    }

    /// Evict a peer and tell the consuming layer.
    pub fn mark_disconnected(&self, name: &str) {
        if let Some(peer) = self.registry.remove(name) {
            info!("Peer {name} marked disconnected ({})", peer.endpoint);
            self.events.emit(NetworkEvent::PeerDisconnected {
                name: peer.username,
                endpoint: peer.endpoint,
            });
        }
    }

    /// Accept connections until shutdown, spawning one reader per connection.
    pub async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        if let Ok(addr) = listener.local_addr() {
            info!("TCP service listening on {addr}");
        }

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted TCP connection from {remote_addr}");
                        self.handle_inbound(stream, remote_addr);
                    }
                    Err(e) => {
                        warn!("TCP accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.wait() => {
                    debug!("TCP accept loop shutting down");
                    break;
                }
            }
        }
    }

    fn handle_inbound(&self, stream: TcpStream, remote_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let conn = PeerConnection::new(remote_addr, Direction::Inbound, write_half);
        let session = SessionState::inbound(remote_addr, self.dedup_capacity);
        self.spawn_reader(conn, read_half, session);
    }

    /// Spawn the task that owns `session` and reads frames off `read_half`.
    fn spawn_reader(
        &self,
        conn: Arc<PeerConnection>,
        read_half: OwnedReadHalf,
        mut session: SessionState,
    ) {
        let registry = Arc::clone(&self.registry);
        let router = Arc::clone(&self.router);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut closed = conn.closed_signal();
            let mut reader = BufReader::new(read_half);
            let remote_addr = conn.remote_addr();

            loop {
                tokio::select! {
                    frame = protocol::read_frame(&mut reader) => match frame {
                        Ok(Some(bytes)) => match Packet::decode_bytes(&bytes) {
                            Ok(packet) => router.route_frame(&mut session, packet, &conn),
                            Err(e) if e.is_recoverable() => {
                                warn!("Skipping frame from {remote_addr}: {e}")
                            }
                            Err(e) => {
                                warn!("Dropping connection from {remote_addr}: {e}");
                                break;
                            }
                        },
                        Ok(None) => {
                            debug!("Connection from {remote_addr} closed by peer");
                            break;
                        }
                        Err(e) => {
                            debug!("{}: {e}", NetworkError::ConnectionReset(remote_addr));
                            break;
                        }
                    },
                    _ = closed.wait_for(|c| *c) => {
                        trace!("Reader for {remote_addr} observed close");
                        break;
                    }
                    _ = shutdown.wait() => break,
                }
            }

            // The peer stays registered; only the dead connection is forgotten.
            if let Some(name) = session.peer() {
                registry.detach_connection(name, conn.id());
            }
            conn.close();
        });
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
