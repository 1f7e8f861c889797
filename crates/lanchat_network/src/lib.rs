//! LAN Chat Network — serverless peer discovery and messaging.
//!
//! This crate provides the networking core for lanchat: every process on
//! the LAN announces itself, finds its peers and exchanges broadcast or
//! private text messages without any central server.
//!
//! # Architecture
//!
//! - **Discovery**: UDP multicast heartbeats, renames, broadcast chat and
//!   typing status on one shared group.
//! - **Transport**: one TCP connection per peer, opened on demand and
//!   introduced with a `HELLO` handshake.
//! - **Protocol**: colon-delimited text packets; TCP frames carry a 4-byte
//!   length prefix.
//! - **Routing**: per-connection dedup of chat messages and dispatch of
//!   everything else to [`NetworkEvent`]s.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanchat_network::{ChatNode, NetworkConfig, NetworkEvent};
//!
//! # async fn example() -> Result<(), lanchat_network::NetworkError> {
//! let mut node = ChatNode::new("alice", NetworkConfig::default())?;
//! let mut events = node.subscribe();
//!
//! node.start().await?;
//! node.send_broadcast("hello, LAN").await?;
//! if let Ok(NetworkEvent::PeerDiscovered { name, .. }) = events.recv().await {
//!     node.send_to_peer(&name, "hi").await?;
//! }
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod shutdown;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use error::NetworkError;
pub use events::NetworkEvent;
pub use identity::MessageId;
pub use message::{ChatMessage, MessageKind};
pub use node::{ChatNode, NodeState, TypingTarget};
pub use peer::{PeerInfo, PeerRegistry};
