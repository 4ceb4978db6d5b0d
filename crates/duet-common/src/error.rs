//! Common error types for Duet.

use thiserror::Error;

use crate::protocol::MediaKind;

/// Result type alias using Duet's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for call setup and negotiation.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, terminal, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local capture could not be started
    #[error("media access error: {0}")]
    MediaAccess(#[from] MediaAccessError),

    /// The signaling channel could not be opened or broke while opening
    #[error("signaling channel error: {0}")]
    SignalingChannel(String),

    /// A local or remote session description was rejected
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// A single ICE candidate was rejected by the peer connection
    #[error("candidate application error: {0}")]
    CandidateApplication(String),

    /// An operation was invoked in a state that does not allow it
    #[error("invalid call order: {0}")]
    InvalidCallOrder(String),

    /// The call token is empty or otherwise unusable
    #[error("invalid call token: {0}")]
    InvalidToken(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why local capture failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("permission to capture media was denied")]
    PermissionDenied,

    #[error("no {0} capture device available")]
    NotFound(MediaKind),

    #[error("capture device failed: {0}")]
    Device(String),
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

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a signaling channel error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::SignalingChannel(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a candidate application error from any displayable type.
    pub fn candidate(msg: impl std::fmt::Display) -> Self {
        Self::CandidateApplication(msg.to_string())
    }

    /// Create an invalid call order error from any displayable type.
    pub fn call_order(msg: impl std::fmt::Display) -> Self {
        Self::InvalidCallOrder(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether the error only affects a single network path.
    ///
    /// Such errors are absorbed by the negotiation engine instead of
    /// aborting the call attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CandidateApplication(_))
    }
}
