//! Transport layer for the connection engine.
//!
//! The engine only requires an ordered byte channel with a
//! connect/read/write/close contract; everything protocol-shaped lives in
//! [`FrameStream`], which layers newline-delimited JSON frames (and, once
//! negotiated, frame-level compression) over any such channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Negotiator / Session              │
//! │         (transport-agnostic)             │
//! └──────────────────┬───────────────────────┘
//!                    │ Frame
//!                    ▼
//!           ┌─────────────────┐
//!           │   FrameStream   │  JSON lines, deflate+base64 when
//!           │                 │  compression is negotiated
//!           └────────┬────────┘
//!                    │ bytes
//!          ┌────────┴─────────┐
//!          ▼                  ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  TcpTransport   │ │ MemoryTransport │
//! │ (TCP + rustls)  │ │ (in-process)    │
//! └─────────────────┘ └─────────────────┘
//! ```

mod tcp;
mod tls;

pub use tcp::TcpTransport;
pub use tls::client_tls_config;

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio_rustls::TlsConnector;

use crate::error::{Result, WireError};
use crate::frame::{decode_b64, encode_b64, Frame};

/// Ordered byte channel the engine runs over.
///
/// Blanket-implemented for anything tokio can read and write; transports
/// supply a boxed instance and never appear in the engine again.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

struct Halves {
    reader: BufReader<ReadHalf<Box<dyn ByteStream>>>,
    writer: WriteHalf<Box<dyn ByteStream>>,
}

/// Framed view over a byte channel.
///
/// Owns the channel for the duration of a connection attempt; the TLS and
/// compression states mutate it in place as their entry operations succeed.
pub struct FrameStream {
    halves: Option<Halves>,
    compressed: bool,
    secured: bool,
}

impl FrameStream {
    /// Wrap a raw byte channel
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            halves: Some(Halves {
                reader: BufReader::new(read),
                writer: write,
            }),
            compressed: false,
            secured: false,
        }
    }

    fn halves(&mut self) -> Result<&mut Halves> {
        self.halves.as_mut().ok_or(WireError::NotConnected)
    }

    /// Whether the channel has been TLS-upgraded
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Whether frame-level compression is active
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Read the next frame, decompressing if negotiated.
    ///
    /// End-of-stream mid-dialogue surfaces as [`WireError::PeerClosed`].
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let compressed = self.compressed;
        let halves = self.halves()?;
        let mut line = String::new();
        let n = halves.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(WireError::PeerClosed);
        }
        decode_line(line.trim_end(), compressed)
    }

    /// Write one frame, compressing if negotiated
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let line = encode_line(frame, self.compressed)?;
        let halves = self.halves()?;
        halves.writer.write_all(line.as_bytes()).await?;
        halves.writer.write_all(b"\n").await?;
        halves.writer.flush().await?;
        Ok(())
    }

    /// Switch every subsequent frame (both directions) to compressed form.
    ///
    /// Must be called only after the COMPRESS/COMPRESS_ACK exchange, on both
    /// sides, or the framing desynchronizes.
    pub fn enable_compression(&mut self) {
        self.compressed = true;
    }

    /// Perform the client-side TLS handshake in place.
    ///
    /// The negotiation dialogue is lockstep, so no plaintext may be buffered
    /// when the upgrade starts; buffered bytes indicate a peer that jumped
    /// ahead and are a protocol error.
    pub async fn secure(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<()> {
        let halves = self.halves.take().ok_or(WireError::NotConnected)?;
        if !halves.reader.buffer().is_empty() {
            return Err(WireError::Protocol(
                "peer sent data before the TLS handshake".to_string(),
            ));
        }
        let io = halves.reader.into_inner().unsplit(halves.writer);

        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| WireError::Tls(format!("invalid server name: {e}")))?;
        let tls = TlsConnector::from(config)
            .connect(name, io)
            .await
            .map_err(|e| WireError::Tls(e.to_string()))?;

        let boxed: Box<dyn ByteStream> = Box::new(tls);
        let (read, write) = tokio::io::split(boxed);
        self.halves = Some(Halves {
            reader: BufReader::new(read),
            writer: write,
        });
        self.secured = true;
        Ok(())
    }

    /// Close the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut halves) = self.halves.take() {
            let _ = halves.writer.shutdown().await;
        }
    }

    /// Split into independent read/write sides for the steady-state tasks.
    ///
    /// Any bytes already buffered on the read side carry over, so frames the
    /// peer sent right after the final negotiation step are not lost.
    pub fn into_split(mut self) -> Result<(FrameReader, FrameWriter)> {
        let halves = self.halves.take().ok_or(WireError::NotConnected)?;
        Ok((
            FrameReader {
                reader: halves.reader,
                compressed: self.compressed,
            },
            FrameWriter {
                writer: halves.writer,
                compressed: self.compressed,
            },
        ))
    }
}

/// Read side of a split [`FrameStream`]
pub struct FrameReader {
    reader: BufReader<ReadHalf<Box<dyn ByteStream>>>,
    compressed: bool,
}

impl FrameReader {
    /// Read the next frame, `None` at end-of-stream
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        decode_line(line.trim_end(), self.compressed).map(Some)
    }
}

/// Write side of a split [`FrameStream`]
pub struct FrameWriter {
    writer: WriteHalf<Box<dyn ByteStream>>,
    compressed: bool,
}

impl FrameWriter {
    /// Write one frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let line = encode_line(frame, self.compressed)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write side down
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// In-process transport over a tokio duplex pipe, for tests and simulation.
pub struct MemoryTransport;

impl MemoryTransport {
    /// Create a connected pair of frame streams
    pub fn pair() -> (FrameStream, FrameStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FrameStream::new(Box::new(a)),
            FrameStream::new(Box::new(b)),
        )
    }
}

fn encode_line(frame: &Frame, compressed: bool) -> Result<String> {
    let json = frame.to_json()?;
    if !compressed {
        return Ok(json);
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json.as_bytes())?;
    let bytes = encoder.finish()?;
    Ok(encode_b64(&bytes))
}

fn decode_line(line: &str, compressed: bool) -> Result<Frame> {
    let json = if compressed {
        let bytes = decode_b64(line)?;
        let mut decoder = DeflateDecoder::new(bytes.as_slice());
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(|e| WireError::Protocol(format!("inflate failed: {e}")))?;
        out
    } else {
        line.to_string()
    };
    Ok(Frame::from_json(&json)?)
}
