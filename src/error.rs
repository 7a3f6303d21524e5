//! Chatwire error types.
//!
//! The connection engine distinguishes two families of failure:
//!
//! - **Recoverable-in-graph** outcomes (`Impossible`, `NotImplemented`) are
//!   *not* errors. They live in [`TransitionOutcome`](crate::graph::walker::TransitionOutcome)
//!   and are fully absorbed by the walker, which retries a sibling state.
//! - **Escaping** failures are `WireError` values: I/O and protocol faults
//!   (fatal to the attempt) and the `Negotiation` variant carrying the walk
//!   diagnostics when the attempt failed as a whole.
//!
//! Everything here is a `thiserror` enum so callers can match on the failure
//! kind without string inspection.

use thiserror::Error;

use crate::graph::walker::NegotiationFailure;

/// Chatwire connection-engine errors.
#[derive(Error, Debug)]
pub enum WireError {
    /// Protocol-level error: the peer sent something the current state
    /// cannot accept.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream mid-dialogue.
    #[error("Peer closed the stream")]
    PeerClosed,

    /// A negotiation step did not complete within its timeout.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// TLS upgrade failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication was rejected by the peer.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The connection attempt failed as a whole; carries the descriptor at
    /// which it failed and the full walk log.
    #[error(transparent)]
    Negotiation(Box<NegotiationFailure>),

    /// Operation requires a live session.
    #[error("Not connected")]
    NotConnected,

    /// Configuration error (invalid file, invalid descriptor set).
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for chatwire operations
pub type Result<T> = std::result::Result<T, WireError>;

impl From<NegotiationFailure> for WireError {
    fn from(failure: NegotiationFailure) -> Self {
        WireError::Negotiation(Box::new(failure))
    }
}

impl From<toml::de::Error> for WireError {
    fn from(err: toml::de::Error) -> Self {
        WireError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for WireError {
    fn from(err: base64::DecodeError) -> Self {
        WireError::Protocol(format!("Base64 decode error: {err}"))
    }
}

impl From<rustls::Error> for WireError {
    fn from(err: rustls::Error) -> Self {
        WireError::Tls(err.to_string())
    }
}
