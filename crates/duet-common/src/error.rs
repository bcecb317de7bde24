//! Common error types for Duet.

use thiserror::Error;

/// Result type alias using Duet's shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding shared types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A well-formed message that violates the signaling protocol
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
