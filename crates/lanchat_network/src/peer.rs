//! Peer registry — the single source of truth for who is online.
//!
//! The map and the local username live behind one lock, and every public
//! method takes that lock exactly once. Each operation is therefore one
//! atomic step: a heartbeat refresh and a sweeper eviction of the same
//! entry can never interleave, and a rekey is never observed half-done.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::NetworkError;
use crate::transport::PeerConnection;

/// Information about a known peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Unique registry key.
    pub username: String,
    /// Address and advertised TCP service port. Port `0` means the service
    /// port is not known yet (peer learned through HELLO or NAME_UPDATE).
    pub endpoint: SocketAddr,
    /// Last heartbeat or successful handshake.
    pub last_heartbeat: Instant,
    /// The TCP connection used to send to this peer, if any.
    pub connection: Option<Arc<PeerConnection>>,
    /// True only for the entry describing this process.
    pub is_local: bool,
}

impl PeerInfo {
    /// Create a fresh entry stamped with the current time.
    pub fn new(username: impl Into<String>, endpoint: SocketAddr, is_local: bool) -> Self {
        Self {
            username: username.into(),
            endpoint,
            last_heartbeat: Instant::now(),
            connection: None,
            is_local,
        }
    }

    /// The open connection, if there is one.
    pub fn open_connection(&self) -> Option<&Arc<PeerConnection>> {
        self.connection.as_ref().filter(|c| !c.is_closed())
    }

    /// Replace the connection, closing the previous one.
    pub fn set_connection(&mut self, connection: Option<Arc<PeerConnection>>) {
        if let Some(old) = self.connection.take() {
            let same = connection.as_ref().is_some_and(|new| new.id() == old.id());
            if !same {
                old.close();
            }
        }
        self.connection = connection;
    }

    /// Close the connection, if any.
    pub fn close_connection(&mut self) {
        self.set_connection(None);
    }
}

/// Outcome of [`PeerRegistry::upsert`].
#[derive(Debug)]
pub enum Upsert {
    /// A new entry was created.
    Inserted(PeerInfo),
    /// An existing entry had its timestamp refreshed.
    Refreshed(PeerInfo),
    /// An existing entry moved; its old connection was closed.
    EndpointChanged { peer: PeerInfo, previous: SocketAddr },
    /// The name belongs to the local entry; nothing changed.
    Rejected,
}

/// Outcome of [`PeerRegistry::rekey`].
#[derive(Debug)]
pub enum Rekey {
    /// The entry now lives under the new name.
    Renamed(PeerInfo),
    /// The new name was already known (its heartbeat arrived first); the
    /// old entry was folded into it.
    Merged { removed: PeerInfo, peer: PeerInfo },
    /// No entry existed under the old name.
    Missing,
    /// One of the names is the local entry.
    Conflict,
}

/// Outcome of [`PeerRegistry::attach_connection`].
#[derive(Debug)]
pub enum Attach {
    /// The connection is now the peer's connection.
    Attached,
    /// The peer already had an open connection, which is returned.
    Existing(Arc<PeerConnection>),
    /// No such peer (or it is the local entry).
    Unknown,
}

/// Outcome of [`PeerRegistry::associate`].
#[derive(Debug)]
pub struct Association {
    /// Set when the peer was not known before.
    pub discovered: Option<PeerInfo>,
    /// Whether the connection became the peer's connection.
    pub attached: bool,
}

#[derive(Debug)]
struct RegistryInner {
    peers: HashMap<String, PeerInfo>,
    local_name: String,
}

/// Concurrent registry of known peers, keyed by username.
#[derive(Debug)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    /// Create an empty registry for a process called `local_name`.
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                peers: HashMap::new(),
                local_name: local_name.into(),
            }),
        }
    }

    /// The current local username.
    pub fn local_name(&self) -> String {
        self.inner.read().local_name.clone()
    }

    /// Whether `name` is the current local username.
    pub fn is_local_name(&self, name: &str) -> bool {
        self.inner.read().local_name == name
    }

    /// Insert or refresh the local entry under the current local username.
    pub fn register_local(&self, endpoint: SocketAddr) -> PeerInfo {
        let mut inner = self.inner.write();
        let name = inner.local_name.clone();
        let entry = inner
            .peers
            .entry(name.clone())
            .or_insert_with(|| PeerInfo::new(name, endpoint, true));
        entry.is_local = true;
        entry.endpoint = endpoint;
        entry.last_heartbeat = Instant::now();
        entry.clone()
    }

    /// Insert a peer, or refresh its timestamp if already known.
    ///
    /// An endpoint change closes the peer's connection, except when the old
    /// endpoint had an unknown service port (`0`): then the connection that
    /// introduced the peer stays valid.
    pub fn upsert(&self, name: &str, endpoint: SocketAddr, is_local: bool) -> Upsert {
        let mut inner = self.inner.write();
        if !is_local && inner.local_name == name {
            return Upsert::Rejected;
        }

        match inner.peers.get_mut(name) {
            Some(existing) => {
                if existing.is_local && !is_local {
                    return Upsert::Rejected;
                }
                existing.last_heartbeat = Instant::now();
                if existing.endpoint == endpoint {
                    return Upsert::Refreshed(existing.clone());
                }

                let previous = existing.endpoint;
                existing.endpoint = endpoint;
                if previous.port() != 0 || previous.ip() != endpoint.ip() {
                    existing.close_connection();
                }
                Upsert::EndpointChanged {
                    peer: existing.clone(),
                    previous,
                }
            }
            None => {
                let peer = PeerInfo::new(name, endpoint, is_local);
                inner.peers.insert(name.to_string(), peer.clone());
                Upsert::Inserted(peer)
            }
        }
    }

    /// Get a peer by name.
    pub fn get(&self, name: &str) -> Option<PeerInfo> {
        self.inner.read().peers.get(name).cloned()
    }

    /// Remove a non-local peer, closing its connection.
    pub fn remove(&self, name: &str) -> Option<PeerInfo> {
        let mut inner = self.inner.write();
        if inner.peers.get(name).is_none_or(|p| p.is_local) {
            return None;
        }
        let mut removed = inner.peers.remove(name)?;
        removed.close_connection();
        Some(removed)
    }

    /// Move a remote peer's entry from `old_name` to `new_name`, keeping its
    /// endpoint, timestamp and connection.
    ///
    /// When `new_name` already exists the old entry is removed instead and
    /// its open connection moves over if the new entry has none.
    pub fn rekey(&self, old_name: &str, new_name: &str) -> Rekey {
        let mut inner = self.inner.write();
        if inner.local_name == old_name || inner.local_name == new_name {
            return Rekey::Conflict;
        }
        if old_name == new_name {
            return Rekey::Missing;
        }
        let Some(mut old) = inner.peers.remove(old_name) else {
            return Rekey::Missing;
        };

        match inner.peers.get_mut(new_name) {
            Some(existing) => {
                if existing.open_connection().is_none() {
                    existing.connection = old.connection.take().filter(|c| !c.is_closed());
                }
                old.close_connection();
                Rekey::Merged {
                    removed: old,
                    peer: existing.clone(),
                }
            }
            None => {
                old.username = new_name.to_string();
                inner.peers.insert(new_name.to_string(), old.clone());
                Rekey::Renamed(old)
            }
        }
    }

    /// Insert a remote peer only if the name is unknown.
    pub fn insert_if_absent(&self, name: &str, endpoint: SocketAddr) -> Option<PeerInfo> {
        let mut inner = self.inner.write();
        if inner.local_name == name || inner.peers.contains_key(name) {
            return None;
        }
        let peer = PeerInfo::new(name, endpoint, false);
        inner.peers.insert(name.to_string(), peer.clone());
        Some(peer)
    }

    /// Rename the local user. Returns the previous name.
    ///
    /// Fails with `DuplicateUsername` when `new_name` belongs to another peer.
    pub fn rename_local(&self, new_name: &str) -> Result<String, NetworkError> {
        let mut inner = self.inner.write();
        let old_name = inner.local_name.clone();
        if old_name == new_name {
            return Ok(old_name);
        }
        if inner.peers.get(new_name).is_some_and(|p| !p.is_local) {
            return Err(NetworkError::DuplicateUsername(new_name.to_string()));
        }

        if let Some(mut local) = inner.peers.remove(&old_name) {
            local.username = new_name.to_string();
            inner.peers.insert(new_name.to_string(), local);
        }
        inner.local_name = new_name.to_string();
        Ok(old_name)
    }

    /// Make `connection` the peer's connection unless it already has an
    /// open one. A newly attached connection counts as a sign of life.
    pub fn attach_connection(&self, name: &str, connection: &Arc<PeerConnection>) -> Attach {
        let mut inner = self.inner.write();
        let Some(peer) = inner.peers.get_mut(name).filter(|p| !p.is_local) else {
            return Attach::Unknown;
        };
        if let Some(existing) = peer.open_connection() {
            if existing.id() == connection.id() {
                return Attach::Attached;
            }
            return Attach::Existing(Arc::clone(existing));
        }
        peer.set_connection(Some(Arc::clone(connection)));
        peer.last_heartbeat = Instant::now();
        Attach::Attached
    }

    /// Record a HELLO: register the peer if unknown, refresh its timestamp
    /// and attach the connection if it has none.
    pub fn associate(
        &self,
        name: &str,
        remote_addr: SocketAddr,
        connection: &Arc<PeerConnection>,
    ) -> Option<Association> {
        let mut inner = self.inner.write();
        if inner.local_name == name {
            return None;
        }

        let mut discovered = None;
        let peer = inner.peers.entry(name.to_string()).or_insert_with(|| {
            let peer = PeerInfo::new(name, SocketAddr::new(remote_addr.ip(), 0), false);
            discovered = Some(peer.clone());
            peer
        });
        peer.last_heartbeat = Instant::now();

        let attached = match peer.open_connection() {
            Some(existing) => existing.id() == connection.id(),
            None => {
                peer.set_connection(Some(Arc::clone(connection)));
                true
            }
        };
        if let Some(d) = discovered.as_mut() {
            d.connection = peer.connection.clone();
        }
        Some(Association {
            discovered,
            attached,
        })
    }

    /// Forget `connection_id` as the peer's connection, if it still is.
    pub fn detach_connection(&self, name: &str, connection_id: u64) -> bool {
        let mut inner = self.inner.write();
        match inner.peers.get_mut(name) {
            Some(peer) if peer.connection.as_ref().is_some_and(|c| c.id() == connection_id) => {
                peer.close_connection();
                true
            }
            _ => false,
        }
    }

    /// Remove every non-local peer silent for longer than `timeout`,
    /// closing their connections.
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<PeerInfo> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .peers
            .values()
            .filter(|p| !p.is_local && now.saturating_duration_since(p.last_heartbeat) > timeout)
            .map(|p| p.username.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|name| inner.peers.remove(&name))
            .map(|mut peer| {
                peer.close_connection();
                peer
            })
            .collect()
    }

    /// Point-in-time copy of every entry, including the local one.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Non-local peers sorted by name.
    pub fn active_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .read()
            .peers
            .values()
            .filter(|p| !p.is_local)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.username.cmp(&b.username));
        peers
    }

    /// Drop every entry, closing all connections.
    pub fn clear(&self) -> Vec<PeerInfo> {
        let mut inner = self.inner.write();
        inner
            .peers
            .drain()
            .map(|(_, mut peer)| {
                peer.close_connection();
                peer
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
