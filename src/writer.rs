//! Backpressured outbound stanza writer.
//!
//! All post-negotiation writes funnel through one task that owns the write
//! half of the transport. Stanzas travel over a bounded channel, so a slow
//! peer propagates backpressure to producers instead of growing an
//! unbounded queue; low-volume control frames (acks, ack requests) use a
//! separate unbounded lane that a full stanza queue cannot starve.
//!
//! Shutdown is signalled over a watch channel. A producer blocked on a
//! full queue observes the signal and fails with [`WireError::NotConnected`]
//! rather than hanging on a connection that will never drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{DrainPolicy, WriterConfig};
use crate::error::{Result, WireError};
use crate::frame::{Frame, Stanza};
use crate::ledger::Ledger;
use crate::session::SessionEvent;
use crate::transport::FrameWriter;

/// Deadline for the shutdown flush; a peer that stopped reading must not
/// pin the writer task forever.
const FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Cloneable handle for enqueueing outbound traffic
#[derive(Clone, Debug)]
pub struct StanzaWriter {
    tx: mpsc::Sender<Stanza>,
    control: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Receiver<bool>,
}

impl StanzaWriter {
    /// Spawn the writer task over the write half of a negotiated transport.
    ///
    /// When a ledger is present every stanza written to the wire is
    /// recorded in it, in write order, before the next stanza is taken.
    pub fn spawn(
        writer: FrameWriter,
        ledger: Option<Arc<Mutex<Ledger>>>,
        config: &WriterConfig,
        shutdown: Arc<watch::Sender<bool>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (control, control_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(run_writer(
            writer,
            ledger,
            rx,
            control_rx,
            config.drain,
            Arc::clone(&shutdown),
            events,
        ));

        let stanza_writer = Self {
            tx,
            control,
            shutdown: shutdown.subscribe(),
        };
        (stanza_writer, handle)
    }

    /// Enqueue a stanza, waiting for queue space when the queue is full.
    ///
    /// Returns [`WireError::NotConnected`] once shutdown has been
    /// signalled, including while blocked waiting for space.
    pub async fn enqueue(&mut self, stanza: Stanza) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(WireError::NotConnected);
        }
        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(stanza);
                    Ok(())
                }
                Err(_) => Err(WireError::NotConnected),
            },
            _ = self.shutdown.changed() => Err(WireError::NotConnected),
        }
    }

    /// Enqueue a control frame. Control frames bypass the bounded stanza
    /// queue and are not counted by the ledger.
    pub fn enqueue_control(&self, frame: Frame) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(WireError::NotConnected);
        }
        self.control
            .send(frame)
            .map_err(|_| WireError::NotConnected)
    }
}

async fn run_writer(
    mut writer: FrameWriter,
    ledger: Option<Arc<Mutex<Ledger>>>,
    mut rx: mpsc::Receiver<Stanza>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    drain: DrainPolicy,
    shutdown: Arc<watch::Sender<bool>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    // An in-flight write stalled on a dead peer must not outlive the
    // shutdown signal; it races a second watch receiver so the task can
    // abandon it. Abandoning mid-write may leave a partial line on the
    // transport, so a stalled lane also skips the flush.
    let mut write_abort = shutdown.subscribe();
    let mut stalled = false;
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            frame = control_rx.recv() => {
                let Some(frame) = frame else { break };
                let result = tokio::select! {
                    r = writer.write_frame(&frame) => r,
                    _ = write_abort.changed() => {
                        stalled = true;
                        break;
                    }
                };
                if let Err(error) = result {
                    tracing::warn!(%error, "control write failed");
                    let _ = events.send(SessionEvent::Disconnected(error));
                    shutdown.send_replace(true);
                    break;
                }
            }

            stanza = rx.recv() => {
                let Some(stanza) = stanza else { break };
                let result = tokio::select! {
                    r = write_stanza(&mut writer, &ledger, stanza) => r,
                    _ = write_abort.changed() => {
                        stalled = true;
                        break;
                    }
                };
                if let Err(error) = result {
                    tracing::warn!(%error, "stanza write failed");
                    let _ = events.send(SessionEvent::Disconnected(error));
                    shutdown.send_replace(true);
                    break;
                }
            }
        }
    }

    if drain == DrainPolicy::Flush && !stalled {
        // Best effort: anything already queued still goes out, but a peer
        // that stops reading mid-flush only gets the deadline
        let flush = async {
            while let Ok(frame) = control_rx.try_recv() {
                if writer.write_frame(&frame).await.is_err() {
                    return;
                }
            }
            while let Ok(stanza) = rx.try_recv() {
                if write_stanza(&mut writer, &ledger, stanza).await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(FLUSH_DEADLINE, flush).await.is_err() {
            tracing::warn!("shutdown flush stalled; discarding remaining frames");
        }
    }
}

async fn write_stanza(
    writer: &mut FrameWriter,
    ledger: &Option<Arc<Mutex<Ledger>>>,
    stanza: Stanza,
) -> Result<()> {
    writer
        .write_frame(&Frame::Stanza {
            stanza: stanza.clone(),
        })
        .await?;
    if let Some(ledger) = ledger {
        ledger.lock().await.record_sent(stanza);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameReader, FrameWriter as PeerWriter, MemoryTransport};

    struct Fixture {
        writer: StanzaWriter,
        handle: JoinHandle<()>,
        peer: FrameReader,
        // held so the duplex stays open for the duration of the test
        _peer_writer: PeerWriter,
        shutdown: Arc<watch::Sender<bool>>,
        _events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn setup(config: WriterConfig, ledger: Option<Arc<Mutex<Ledger>>>) -> Fixture {
        let (client, server) = MemoryTransport::pair();
        let (peer, peer_writer) = server.into_split().unwrap();
        let (_, client_writer) = client.into_split().unwrap();
        let shutdown = Arc::new(watch::channel(false).0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer, handle) = StanzaWriter::spawn(
            client_writer,
            ledger,
            &config,
            Arc::clone(&shutdown),
            events_tx,
        );
        Fixture {
            writer,
            handle,
            peer,
            _peer_writer: peer_writer,
            shutdown,
            _events: events_rx,
        }
    }

    #[tokio::test]
    async fn test_stanzas_arrive_in_order() {
        let mut fx = setup(WriterConfig::default(), None);

        fx.writer.enqueue(Stanza::message("one")).await.unwrap();
        fx.writer.enqueue(Stanza::message("two")).await.unwrap();

        for expected in ["one", "two"] {
            match fx.peer.read_frame().await.unwrap() {
                Some(Frame::Stanza { stanza }) => assert_eq!(stanza.body, expected),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        fx.shutdown.send_replace(true);
        fx.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_control_frames_bypass_stanza_queue() {
        let mut fx = setup(WriterConfig::default(), None);

        fx.writer.enqueue_control(Frame::Ack { h: 7 }).unwrap();
        match fx.peer.read_frame().await.unwrap() {
            Some(Frame::Ack { h }) => assert_eq!(h, 7),
            other => panic!("unexpected frame: {other:?}"),
        }

        fx.shutdown.send_replace(true);
        fx.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ledger_counts_writes() {
        let ledger = Arc::new(Mutex::new(Ledger::new()));
        let mut fx = setup(WriterConfig::default(), Some(Arc::clone(&ledger)));

        fx.writer.enqueue(Stanza::message("hi")).await.unwrap();
        assert!(fx.peer.read_frame().await.unwrap().is_some());

        // record_sent runs right after the wire write completes
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while ledger.lock().await.sent() != 1 {
            assert!(tokio::time::Instant::now() < deadline, "sent count never updated");
            tokio::task::yield_now().await;
        }

        fx.shutdown.send_replace(true);
        fx.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_full_queue() {
        let mut fx = setup(
            WriterConfig {
                queue_capacity: 1,
                drain: DrainPolicy::Discard,
            },
            None,
        );

        // Peer stops reading; large bodies fill the transport buffer and
        // then the bounded queue, so producers start blocking.
        let big = "x".repeat(32 * 1024);
        let mut blocked = false;
        for _ in 0..8 {
            let send = fx.writer.enqueue(Stanza::message(big.clone()));
            match tokio::time::timeout(std::time::Duration::from_millis(50), send).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    blocked = true;
                    break;
                }
            }
        }
        assert!(blocked, "writer never hit backpressure");

        fx.shutdown.send_replace(true);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            fx.writer.enqueue(Stanza::message("late")),
        )
        .await
        .expect("enqueue did not observe shutdown");
        assert!(matches!(result, Err(WireError::NotConnected)));

        // Unstall the writer task's in-flight wire write so it can exit
        let mut peer = fx.peer;
        let drain = tokio::spawn(async move {
            while let Ok(Some(_)) = peer.read_frame().await {}
        });
        fx.handle.await.unwrap();
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_bounded_when_peer_stalls() {
        let mut fx = setup(WriterConfig::default(), None);

        // Peer never reads; fill the transport buffer so the write side
        // stalls with stanzas still queued behind it.
        let big = "x".repeat(32 * 1024);
        for _ in 0..4 {
            let send = fx.writer.enqueue(Stanza::message(big.clone()));
            if tokio::time::timeout(std::time::Duration::from_millis(100), send)
                .await
                .is_err()
            {
                break;
            }
        }

        fx.shutdown.send_replace(true);
        tokio::time::timeout(std::time::Duration::from_secs(60), fx.handle)
            .await
            .expect("writer task outlived the shutdown deadline")
            .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails_fast() {
        let fx = setup(WriterConfig::default(), None);
        let mut writer = fx.writer;

        fx.shutdown.send_replace(true);
        fx.handle.await.unwrap();

        let result = writer.enqueue(Stanza::message("late")).await;
        assert!(matches!(result, Err(WireError::NotConnected)));
        let result = writer.enqueue_control(Frame::AckRequest);
        assert!(matches!(result, Err(WireError::NotConnected)));
    }

    #[tokio::test]
    async fn test_flush_drains_queue_on_shutdown() {
        let mut fx = setup(WriterConfig::default(), None);

        fx.writer
            .enqueue(Stanza::message("pending"))
            .await
            .unwrap();
        fx.shutdown.send_replace(true);
        fx.handle.await.unwrap();

        let mut seen = false;
        while let Ok(Some(frame)) = fx.peer.read_frame().await {
            if matches!(&frame, Frame::Stanza { stanza } if stanza.body == "pending") {
                seen = true;
                break;
            }
        }
        assert!(seen, "queued stanza was dropped");
    }
}
