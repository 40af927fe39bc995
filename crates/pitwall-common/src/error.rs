//! Common error types for Pitwall.

use thiserror::Error;

/// Result type alias using Pitwall's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Pitwall operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (stdin, sockets, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signaling channel failure (connect, send, closed)
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Answer or candidate for a team address with no connection entry
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Applying or producing a session description failed
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    /// Microphone could not be opened
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Pre-transmission cue could not be played
    #[error("cue failure: {0}")]
    Cue(String),

    /// Peer transport error outside of description handling
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create an unknown peer error for a remote team address.
    pub fn unknown_peer(remote_id: impl Into<String>) -> Self {
        Self::UnknownPeer(remote_id.into())
    }

    /// Create a negotiation error for a remote team address.
    pub fn negotiation(peer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Negotiation {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a media acquisition error from any displayable type.
    pub fn media_acquisition(msg: impl std::fmt::Display) -> Self {
        Self::MediaAcquisition(msg.to_string())
    }

    /// Create a cue error from any displayable type.
    pub fn cue(msg: impl std::fmt::Display) -> Self {
        Self::Cue(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether this error only affects a single envelope or entry.
    ///
    /// The engine logs these and keeps running.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            Self::UnknownPeer(_)
                | Self::Negotiation { .. }
                | Self::Cue(_)
                | Self::Transport(_)
                | Self::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_error_message() {
        let err = Error::negotiation("redteam", "bad sdp");
        assert_eq!(err.to_string(), "negotiation with redteam failed: bad sdp");
    }

    #[test]
    fn test_contained_errors() {
        assert!(Error::unknown_peer("blueteam").is_contained());
        assert!(Error::cue("no output device").is_contained());
        assert!(!Error::media_acquisition("denied").is_contained());
        assert!(!Error::config("empty team").is_contained());
    }
}
