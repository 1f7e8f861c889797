//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the lanchat_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The requested TCP port was already bound by another process.
    #[error("Address in use: {0}")]
    AddressInUse(SocketAddr),

    /// A TCP connect to the peer failed or timed out.
    #[error("Peer unreachable: {name} at {endpoint}")]
    PeerUnreachable { name: String, endpoint: SocketAddr },

    /// A frame or datagram could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// An outgoing payload is larger than a peer will accept.
    #[error("Message too large: {len} bytes (limit {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// A payload carried a tag this protocol does not define.
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    /// A rename collided with a name held by another peer.
    #[error("Username already in use: {0}")]
    DuplicateUsername(String),

    /// The username is empty or contains the wire delimiter.
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    /// The TCP connection was closed or reset under us.
    #[error("Connection reset by {0}")]
    ConnectionReset(SocketAddr),

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// The configuration failed validation.
    #[error("Invalid config: {0}")]
    Config(String),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether a reader loop may skip past this error and keep the
    /// connection open.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownTag(_) | Self::MalformedFrame(_))
    }
}
