//! Error types for the voicelink control plane.
//!
//! Nothing in this crate terminates the process on failure: transport errors
//! degrade into a reconnect cycle, placement and handshake errors reject the
//! caller's `join`, and everything else is surfaced as an event.

use serenity::model::id::GuildId;
use thiserror::Error;

/// Main error type for node, session and manager operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// No Ready, non-draining node could take a new session
    #[error("No available voice nodes for region {region}")]
    NoAvailableNode { region: String },

    /// The gateway never delivered voice credentials in time
    #[error("Voice connection timeout for guild {guild_id}")]
    JoinTimeout { guild_id: GuildId },

    /// The session disconnected before the join handshake completed
    #[error("Disconnected")]
    Disconnected,

    /// A newer join for the same guild replaced this one
    #[error("Join superseded by a newer request for guild {guild_id}")]
    JoinSuperseded { guild_id: GuildId },

    /// Outbound payload could not be encoded
    #[error("Unable to stringify payload: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Inbound frame was not valid JSON
    #[error("Unable to parse ws message: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// Socket-level failure talking to a node
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// A handshake header could not be built from the node options
    #[error("Invalid handshake header {name}")]
    InvalidHeader { name: &'static str },

    /// The external gateway client refused or failed a request
    #[error("Gateway error: {message}")]
    Gateway { message: String },

    /// The manager task has stopped
    #[error("Player manager is no longer running")]
    ManagerClosed,

    /// Bad node or manager options
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Convenience constructor for gateway failures
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
        }
    }
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_keep_original_wording() {
        assert_eq!(LinkError::Disconnected.to_string(), "Disconnected");

        let err = LinkError::JoinTimeout {
            guild_id: GuildId::new(42),
        };
        assert_eq!(err.to_string(), "Voice connection timeout for guild 42");

        let err = LinkError::NoAvailableNode {
            region: "eu".to_string(),
        };
        assert!(err.to_string().contains("eu"));
    }
}
