//! TCP transport.
//!
//! The production byte channel: a plain TCP connection the TLS state can
//! later upgrade in place.

use tokio::net::TcpStream;

use super::FrameStream;
use crate::config::EndpointConfig;
use crate::error::{Result, WireError};

/// TCP byte-channel factory.
pub struct TcpTransport;

impl TcpTransport {
    /// Connect to the configured endpoint within its connect timeout.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<FrameStream> {
        let addr = endpoint.remote_addr();
        tracing::debug!("Connecting to {}", addr);

        let stream = tokio::time::timeout(endpoint.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| WireError::Timeout(format!("connect to {addr}")))??;

        // Negotiation frames are small; don't let Nagle sit on them
        stream.set_nodelay(true)?;

        tracing::debug!("Connected to {}", addr);
        Ok(FrameStream::new(Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_surfaces_io_error() {
        // Port 1 on localhost is essentially never listening
        let endpoint = EndpointConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_secs: 2,
            ..Default::default()
        };
        let result = TcpTransport::connect(&endpoint).await;
        assert!(result.is_err());
    }
}
