//! Authentication mechanism provider seam.
//!
//! Mechanism implementations are external collaborators: the negotiation
//! engine only needs a name to offer, an initial response, and a challenge
//! responder. A PLAIN-style mechanism ships as the default; anything
//! stronger plugs in through the same trait.

use crate::error::{Result, WireError};

/// One authentication mechanism instance, consumed by a single attempt.
pub trait AuthMechanism: Send {
    /// Mechanism name as advertised/selected on the wire
    fn name(&self) -> &str;

    /// Initial client response sent with the AUTH frame
    fn initial_response(&mut self) -> Result<Vec<u8>>;

    /// Respond to a server challenge
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// PLAIN mechanism: `\0authcid\0password` in a single initial response.
pub struct PlainAuth {
    authcid: String,
    password: String,
}

impl PlainAuth {
    /// Create a PLAIN mechanism for the given credentials
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl AuthMechanism for PlainAuth {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.authcid.len() + self.password.len() + 2);
        out.push(0);
        out.extend_from_slice(self.authcid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Ok(out)
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        // PLAIN is single-step; a challenge means the peer is off-script
        Err(WireError::Protocol(
            "PLAIN mechanism received an unexpected challenge".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response() {
        let mut plain = PlainAuth::new("alice", "hunter2");
        let response = plain.initial_response().unwrap();
        assert_eq!(response, b"\x00alice\x00hunter2");
        assert_eq!(plain.name(), "PLAIN");
    }

    #[test]
    fn test_plain_rejects_challenge() {
        let mut plain = PlainAuth::new("alice", "hunter2");
        assert!(plain.respond(b"nonce").is_err());
    }
}
