//! Message identity and username rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Field delimiter of the wire protocol. Usernames may not contain it.
pub const FIELD_DELIMITER: char = ':';

/// A globally unique message identifier, generated by the sender.
///
/// Used only for de-duplication; it carries no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    /// Generate a new random message ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse a message ID from its wire form.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| NetworkError::MalformedFrame(format!("invalid message id {s:?}: {e}")))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Check that `name` can be carried in a protocol field.
pub fn validate_username(name: &str) -> Result<(), NetworkError> {
    if name.trim().is_empty() || name.contains(FIELD_DELIMITER) {
        return Err(NetworkError::InvalidUsername(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
