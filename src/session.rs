//! Established sessions: connection setup, the inbound reader task, and
//! the steady-state stanza API.
//!
//! [`Connection`] drives the whole establishment sequence: TCP connect,
//! the state-graph walk, and the post-walk stream-management step. A
//! successful walk yields a [`Session`], which splits the transport into
//! a reader task (inbound stanzas, acks, close) and the writer task from
//! [`crate::writer`], coupled only through the shared ledger and a watch
//! channel that fans a single shutdown decision out to both.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::AuthMechanism;
use crate::config::Config;
use crate::error::{Result, WireError};
use crate::frame::{Frame, Stanza};
use crate::graph::{DescriptorSet, Negotiated, Negotiator, Walker};
use crate::ledger::{Ledger, ResumeState};
use crate::transport::{FrameReader, FrameStream, TcpTransport};
use crate::writer::StanzaWriter;

/// How long shutdown waits for the I/O tasks before abandoning them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Inbound events surfaced to the session consumer
#[derive(Debug)]
pub enum SessionEvent {
    /// A stanza from the peer
    Stanza(Stanza),
    /// The peer closed the stream cleanly
    Closed,
    /// The connection failed; [`Session::resume_state`] may still produce
    /// a token for re-establishment
    Disconnected(WireError),
}

/// Connection establishment entry points.
pub struct Connection;

impl Connection {
    /// Connect over TCP and negotiate a session.
    ///
    /// `resume` carries the ledger and token of a previous session; when
    /// present the walker will prefer resumption states the peer offers.
    pub async fn connect(
        config: &Config,
        auth: Box<dyn AuthMechanism>,
        resume: Option<ResumeState>,
    ) -> Result<Session> {
        tracing::info!(addr = %config.endpoint.remote_addr(), "connecting");
        let stream = TcpTransport::connect(&config.endpoint).await?;
        Self::establish(config, stream, auth, resume).await
    }

    /// Negotiate a session over an already-established transport.
    pub async fn establish(
        config: &Config,
        stream: FrameStream,
        auth: Box<dyn AuthMechanism>,
        resume: Option<ResumeState>,
    ) -> Result<Session> {
        let set = DescriptorSet::for_modules(&config.modules)?;
        let walker = Walker::new(set);

        let mut negotiator = Negotiator::new(stream, config, auth, resume)?;
        if let Err(error) = negotiator.start().await {
            negotiator.abort().await;
            return Err(error);
        }

        let walk = match walker.run(&mut negotiator).await {
            Ok(walk) => walk,
            Err(failure) => {
                negotiator.abort().await;
                return Err(failure.into());
            }
        };
        tracing::info!(
            terminal = %walk.terminal,
            path = ?walk.context.visited(),
            "negotiation complete"
        );

        if let Err(error) = negotiator.finish().await {
            negotiator.abort().await;
            return Err(error);
        }

        Session::spawn(config, negotiator.into_parts())
    }
}

/// An established session over a negotiated transport.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    writer: StanzaWriter,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
    ledger: Option<Arc<Mutex<Ledger>>>,
    resume_token: Option<String>,
    address: Option<String>,
    resumed: bool,
}

impl Session {
    pub(crate) fn spawn(config: &Config, negotiated: Negotiated) -> Result<Self> {
        let Negotiated {
            stream,
            ledger,
            resume_token,
            address,
            resumed,
        } = negotiated;

        let (reader, writer_half) = stream.into_split()?;
        let ledger = ledger.map(|l| Arc::new(Mutex::new(l)));
        let shutdown = Arc::new(watch::channel(false).0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (writer, writer_handle) = StanzaWriter::spawn(
            writer_half,
            ledger.clone(),
            &config.writer,
            Arc::clone(&shutdown),
            events_tx.clone(),
        );
        let reader_handle = tokio::spawn(run_reader(
            reader,
            ledger.clone(),
            writer.clone(),
            events_tx,
            Arc::clone(&shutdown),
        ));

        let id = Uuid::new_v4();
        tracing::info!(session = %id, resumed, "session established");

        Ok(Self {
            id,
            writer,
            events: events_rx,
            shutdown,
            handles: vec![writer_handle, reader_handle],
            ledger,
            resume_token,
            address,
            resumed,
        })
    }

    /// Session identifier, unique per established session
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The address the peer bound this session to, when one was assigned
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Whether this session was resumed rather than freshly bound
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// The resumption token, when stream management is active
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// A cloneable outbound handle, for producers on other tasks
    pub fn writer(&self) -> StanzaWriter {
        self.writer.clone()
    }

    /// Send a stanza, waiting when the outbound queue is full.
    pub async fn send(&mut self, stanza: Stanza) -> Result<()> {
        self.writer.enqueue(stanza).await
    }

    /// Ask the peer to acknowledge everything received so far.
    pub fn request_ack(&self) -> Result<()> {
        self.writer.enqueue_control(Frame::AckRequest)
    }

    /// Next inbound event. `None` after shutdown has completed and the
    /// event queue is drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Snapshot the state needed to resume this session later. `None`
    /// when stream management was not negotiated.
    pub async fn resume_state(&self) -> Option<ResumeState> {
        let token = self.resume_token.clone()?;
        let ledger = self.ledger.as_ref()?;
        Some(ResumeState {
            token,
            ledger: ledger.lock().await.clone(),
        })
    }

    /// Shut the session down and wait for both I/O tasks to exit.
    /// Idempotent.
    pub async fn shutdown(&mut self) {
        // Best effort; the writer flushes it under the default drain policy
        let _ = self.writer.enqueue_control(Frame::Close);
        self.shutdown.send_replace(true);
        for mut handle in self.handles.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                tracing::warn!(session = %self.id, "io task missed the shutdown grace");
                handle.abort();
            }
        }
        tracing::info!(session = %self.id, "session closed");
    }
}

async fn run_reader(
    mut reader: FrameReader,
    ledger: Option<Arc<Mutex<Ledger>>>,
    control: StanzaWriter,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            frame = reader.read_frame() => match frame {
                Ok(Some(Frame::Stanza { stanza })) => {
                    if let Some(ledger) = &ledger {
                        ledger.lock().await.record_received();
                    }
                    if events.send(SessionEvent::Stanza(stanza)).is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Ack { h })) => {
                    if let Some(ledger) = &ledger {
                        if let Err(error) = ledger.lock().await.apply_ack(h) {
                            tracing::warn!(%error, "peer ack diverged from ledger");
                            let _ = events.send(SessionEvent::Disconnected(error));
                            shutdown.send_replace(true);
                            break;
                        }
                    }
                }
                Ok(Some(Frame::AckRequest)) => {
                    if let Some(ledger) = &ledger {
                        let h = ledger.lock().await.received();
                        if control.enqueue_control(Frame::Ack { h }).is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(Frame::Close)) => {
                    let _ = events.send(SessionEvent::Closed);
                    shutdown.send_replace(true);
                    break;
                }
                Ok(Some(other)) => {
                    tracing::debug!(tag = other.tag(), "ignoring unexpected frame");
                }
                Ok(None) => {
                    let _ = events.send(SessionEvent::Disconnected(WireError::PeerClosed));
                    shutdown.send_replace(true);
                    break;
                }
                Err(error) => {
                    let _ = events.send(SessionEvent::Disconnected(error));
                    shutdown.send_replace(true);
                    break;
                }
            }
        }
    }
}
