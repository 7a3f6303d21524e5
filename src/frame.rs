//! Wire frames for the negotiation dialogue and steady-state traffic.
//!
//! Frames are newline-delimited JSON envelopes. Schema fidelity to any
//! particular federated-messaging wire format is explicitly not a goal of
//! this crate; the frames exist so that each negotiation state performs a
//! genuine request/response exchange and so that acknowledgment traffic has
//! a concrete shape for the stream-management ledger.
//!
//! Once the compression state has been entered, every subsequent line on the
//! wire is the base64 of the deflate-compressed JSON text; framing stays
//! line-oriented either way (see [`crate::transport`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A typed outbound/inbound protocol payload once a session exists.
///
/// Payload modeling is external to this crate; the engine treats the body as
/// opaque text produced/consumed by the payload layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    /// Stanza kind
    pub kind: StanzaKind,
    /// Opaque serialized payload
    pub body: String,
}

/// Stanza kinds carried over a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    /// Directed chat payload
    Message,
    /// Availability broadcast
    Presence,
    /// Request/response payload
    Iq,
}

impl Stanza {
    /// Create a message stanza
    pub fn message(body: impl Into<String>) -> Self {
        Self {
            kind: StanzaKind::Message,
            body: body.into(),
        }
    }

    /// Create a presence stanza
    pub fn presence(body: impl Into<String>) -> Self {
        Self {
            kind: StanzaKind::Presence,
            body: body.into(),
        }
    }

    /// Create an iq stanza
    pub fn iq(body: impl Into<String>) -> Self {
        Self {
            kind: StanzaKind::Iq,
            body: body.into(),
        }
    }
}

/// Features the peer advertises for the current stream state.
///
/// Re-sent by the peer after every stream-restarting step (TLS upgrade,
/// authentication), so the set reflects what is negotiable *now*.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFeatures {
    /// Peer supports the TLS upgrade
    #[serde(default)]
    pub tls: bool,
    /// Peer refuses to proceed without TLS
    #[serde(default)]
    pub tls_required: bool,
    /// Authentication mechanisms offered, in peer preference order
    #[serde(default)]
    pub mechanisms: Vec<String>,
    /// Peer supports frame-level compression
    #[serde(default)]
    pub compression: bool,
    /// Peer supports stream management (acks + resumption)
    #[serde(default)]
    pub stream_management: bool,
    /// Peer supports instant resumption
    #[serde(default)]
    pub instant_resume: bool,
}

/// Protocol frame envelope.
///
/// `SCREAMING_SNAKE_CASE` tags keep the wire shape greppable in captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Peer feature advertisement
    Features {
        /// What the peer is willing to negotiate right now
        features: PeerFeatures,
    },

    /// Request the TLS upgrade
    StartTls,
    /// Peer go-ahead for the TLS handshake
    Proceed,

    /// Open authentication with a mechanism and initial response
    Auth {
        /// Mechanism name
        mechanism: String,
        /// Base64 initial response
        response: String,
    },
    /// Peer challenge during a multi-step mechanism
    Challenge {
        /// Base64 challenge data
        data: String,
    },
    /// Client answer to a challenge
    AuthResponse {
        /// Base64 response data
        data: String,
    },
    /// Authentication accepted
    AuthSuccess,
    /// Authentication rejected
    AuthFailure {
        /// Peer-supplied reason
        reason: String,
    },

    /// Request frame-level compression
    Compress,
    /// Peer accepted compression; next line onward is compressed
    CompressAck,

    /// Request resource binding
    Bind {
        /// Requested resource, peer-assigned when absent
        resource: Option<String>,
    },
    /// Binding complete
    Bound {
        /// Full bound address
        address: String,
    },

    /// Enable stream management for this session
    SmEnable,
    /// Stream management active
    SmEnabled {
        /// Token for later resumption
        token: String,
    },
    /// Resume a previous stream after re-authenticating
    SmResume {
        /// Resumption token from the previous session
        token: String,
        /// Count of stanzas we had received when the stream broke
        h: u32,
    },
    /// Stream resumed
    SmResumed {
        /// Count of our stanzas the peer had received
        h: u32,
    },
    /// Resumption rejected; fall back to binding a fresh stream
    SmFailed {
        /// Peer-supplied reason
        reason: String,
    },

    /// Instant resumption: skip auth and bind in one exchange
    InstantResume {
        /// Resumption token from the previous session
        token: String,
        /// Count of stanzas we had received when the stream broke
        h: u32,
    },
    /// Instant resumption accepted; stream is authenticated and bound
    InstantResumed {
        /// Count of our stanzas the peer had received
        h: u32,
        /// Full bound address
        address: String,
    },
    /// Instant resumption rejected
    InstantRejected {
        /// Peer-supplied reason
        reason: String,
    },

    /// Steady-state payload
    Stanza {
        /// The payload
        stanza: Stanza,
    },
    /// Ask the peer for its current received count
    AckRequest,
    /// Received-count report
    Ack {
        /// Count of stanzas received, mod 2^32
        h: u32,
    },

    /// Orderly stream termination
    Close,
}

impl Frame {
    /// Serialize to a single JSON line (no trailing newline)
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON line
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get features from a FEATURES frame
    pub fn features(&self) -> Option<&PeerFeatures> {
        match self {
            Frame::Features { features } => Some(features),
            _ => None,
        }
    }

    /// Short tag for logging and timeout messages
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Features { .. } => "FEATURES",
            Frame::StartTls => "START_TLS",
            Frame::Proceed => "PROCEED",
            Frame::Auth { .. } => "AUTH",
            Frame::Challenge { .. } => "CHALLENGE",
            Frame::AuthResponse { .. } => "AUTH_RESPONSE",
            Frame::AuthSuccess => "AUTH_SUCCESS",
            Frame::AuthFailure { .. } => "AUTH_FAILURE",
            Frame::Compress => "COMPRESS",
            Frame::CompressAck => "COMPRESS_ACK",
            Frame::Bind { .. } => "BIND",
            Frame::Bound { .. } => "BOUND",
            Frame::SmEnable => "SM_ENABLE",
            Frame::SmEnabled { .. } => "SM_ENABLED",
            Frame::SmResume { .. } => "SM_RESUME",
            Frame::SmResumed { .. } => "SM_RESUMED",
            Frame::SmFailed { .. } => "SM_FAILED",
            Frame::InstantResume { .. } => "INSTANT_RESUME",
            Frame::InstantResumed { .. } => "INSTANT_RESUMED",
            Frame::InstantRejected { .. } => "INSTANT_REJECTED",
            Frame::Stanza { .. } => "STANZA",
            Frame::AckRequest => "ACK_REQUEST",
            Frame::Ack { .. } => "ACK",
            Frame::Close => "CLOSE",
        }
    }
}

/// Base64-encode binary mechanism data for a frame field
pub fn encode_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a base64 frame field
pub fn decode_b64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_roundtrip() {
        let frame = Frame::Features {
            features: PeerFeatures {
                tls: true,
                tls_required: false,
                mechanisms: vec!["PLAIN".to_string()],
                compression: true,
                stream_management: true,
                instant_resume: false,
            },
        };

        let json = frame.to_json().unwrap();
        assert!(json.contains("\"FEATURES\""));

        let parsed = Frame::from_json(&json).unwrap();
        let features = parsed.features().unwrap();
        assert!(features.tls);
        assert_eq!(features.mechanisms, vec!["PLAIN".to_string()]);
    }

    #[test]
    fn test_ack_frame() {
        let frame = Frame::Ack { h: 4_294_967_295 };
        let json = frame.to_json().unwrap();
        let parsed = Frame::from_json(&json).unwrap();
        assert_eq!(parsed, Frame::Ack { h: u32::MAX });
    }

    #[test]
    fn test_stanza_frame() {
        let frame = Frame::Stanza {
            stanza: Stanza::message("hello"),
        };
        let json = frame.to_json().unwrap();
        let parsed = Frame::from_json(&json).unwrap();
        match parsed {
            Frame::Stanza { stanza } => {
                assert_eq!(stanza.kind, StanzaKind::Message);
                assert_eq!(stanza.body, "hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_b64_helpers() {
        let data = b"\x00user\x00secret";
        let encoded = encode_b64(data);
        assert_eq!(decode_b64(&encoded).unwrap(), data);
    }

    #[test]
    fn test_unknown_field_tolerated() {
        // Forward compatibility: extra fields from newer peers are ignored
        let json = r#"{"type":"SM_ENABLED","token":"abc","max_age":600}"#;
        let parsed = Frame::from_json(json).unwrap();
        assert_eq!(
            parsed,
            Frame::SmEnabled {
                token: "abc".to_string()
            }
        );
    }
}
