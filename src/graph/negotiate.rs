//! Live state entry: the [`StateSpace`] implementation that talks to a
//! real peer.
//!
//! The negotiator owns the framed transport for the duration of one
//! connection attempt and accumulates connection facts (the peer's feature
//! advertisements) as stream-restarting steps complete. Feasibility checks
//! are pure queries against those facts; entry operations perform the
//! request/response exchange for their state, each bounded by the
//! configured step timeout. A timeout or an off-script peer frame is fatal
//! to the attempt; a peer refusal that the graph can route around (a
//! rejected resumption token) is merely impossible.

use std::future::Future;
use std::sync::Arc;

use super::descriptor::StateId;
use super::walker::{Feasibility, StateSpace, TransitionOutcome};
use crate::auth::AuthMechanism;
use crate::config::Config;
use crate::error::{Result, WireError};
use crate::frame::{decode_b64, encode_b64, Frame, PeerFeatures};
use crate::ledger::{Ledger, ResumeState};
use crate::transport::{client_tls_config, FrameStream};

/// Everything a successful walk produced, handed to the session layer.
pub struct Negotiated {
    /// The negotiated transport (possibly TLS-upgraded and compressed)
    pub stream: FrameStream,
    /// Ledger, present when stream management was enabled or resumed
    pub ledger: Option<Ledger>,
    /// Token for resuming this stream later
    pub resume_token: Option<String>,
    /// Bound address, absent on resumed streams that kept their old one
    pub address: Option<String>,
    /// Whether the walk ended in a resumption rather than a fresh bind
    pub resumed: bool,
}

/// Per-attempt negotiation driver.
pub struct Negotiator {
    stream: FrameStream,
    config: Config,
    auth: Box<dyn AuthMechanism>,
    features: PeerFeatures,
    resume: Option<ResumeState>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    ledger: Option<Ledger>,
    resume_token: Option<String>,
    address: Option<String>,
    resumed: bool,
}

impl Negotiator {
    /// Create a negotiator for one attempt over an established transport.
    pub fn new(
        stream: FrameStream,
        config: &Config,
        auth: Box<dyn AuthMechanism>,
        resume: Option<ResumeState>,
    ) -> Result<Self> {
        let tls_config = if config.modules.tls {
            Some(client_tls_config(&config.tls)?)
        } else {
            None
        };
        Ok(Self {
            stream,
            config: config.clone(),
            auth,
            features: PeerFeatures::default(),
            resume,
            tls_config,
            ledger: None,
            resume_token: None,
            address: None,
            resumed: false,
        })
    }

    /// Read the peer's initial feature advertisement. Must complete before
    /// the walk starts; without it every feasibility check would be blind.
    pub async fn start(&mut self) -> Result<()> {
        match self.read_timed("FEATURES").await? {
            Frame::Features { features } => {
                tracing::debug!(?features, "peer features");
                self.features = features;
                Ok(())
            }
            other => Err(WireError::Protocol(format!(
                "expected FEATURES, got {}",
                other.tag()
            ))),
        }
    }

    /// Current peer-advertised features
    pub fn features(&self) -> &PeerFeatures {
        &self.features
    }

    /// Post-walk step: enable stream management on freshly bound streams
    /// when both sides support it. Resumed streams already carry their
    /// ledger.
    pub async fn finish(&mut self) -> Result<()> {
        if self.resumed
            || !self.config.modules.stream_management
            || !self.features.stream_management
        {
            return Ok(());
        }
        self.stream.write_frame(&Frame::SmEnable).await?;
        match self.read_timed("SM_ENABLED").await? {
            Frame::SmEnabled { token } => {
                tracing::debug!("stream management enabled");
                self.ledger = Some(Ledger::new());
                self.resume_token = Some(token);
                Ok(())
            }
            other => Err(WireError::Protocol(format!(
                "expected SM_ENABLED, got {}",
                other.tag()
            ))),
        }
    }

    /// Hand the negotiated transport and session facts over
    pub fn into_parts(self) -> Negotiated {
        Negotiated {
            stream: self.stream,
            ledger: self.ledger,
            resume_token: self.resume_token,
            address: self.address,
            resumed: self.resumed,
        }
    }

    /// Abandon the attempt, releasing every resource acquired by completed
    /// states (the socket and any TLS channel upgraded over it).
    pub async fn abort(mut self) {
        self.stream.close().await;
    }

    async fn read_timed(&mut self, expect: &str) -> Result<Frame> {
        match tokio::time::timeout(
            self.config.endpoint.step_timeout(),
            self.stream.read_frame(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WireError::Timeout(expect.to_string())),
        }
    }

    fn off_script(expected: &str, got: &Frame) -> WireError {
        WireError::Protocol(format!("expected {expected}, got {}", got.tag()))
    }

    /// Entry operation for one state. `Err` means fatal; recoverable
    /// refusals come back as `Ok(Impossible)`.
    async fn try_enter(&mut self, id: StateId) -> Result<TransitionOutcome> {
        match id {
            StateId::Connected => Ok(TransitionOutcome::Impossible(
                "initial state is never re-entered".to_string(),
            )),

            StateId::TlsSecured => {
                let Some(tls_config) = self.tls_config.clone() else {
                    return Ok(TransitionOutcome::NotImplemented);
                };
                self.stream.write_frame(&Frame::StartTls).await?;
                match self.read_timed("PROCEED").await? {
                    Frame::Proceed => {}
                    other => return Err(Self::off_script("PROCEED", &other)),
                }
                self.stream
                    .secure(tls_config, &self.config.endpoint.domain)
                    .await?;
                // The upgrade restarts the stream; the peer re-advertises
                match self.read_timed("FEATURES").await? {
                    Frame::Features { features } => self.features = features,
                    other => return Err(Self::off_script("FEATURES", &other)),
                }
                Ok(TransitionOutcome::Success)
            }

            StateId::Authenticated => {
                let initial = self.auth.initial_response()?;
                self.stream
                    .write_frame(&Frame::Auth {
                        mechanism: self.auth.name().to_string(),
                        response: encode_b64(&initial),
                    })
                    .await?;
                loop {
                    match self.read_timed("AUTH_SUCCESS").await? {
                        Frame::Challenge { data } => {
                            let answer = self.auth.respond(&decode_b64(&data)?)?;
                            self.stream
                                .write_frame(&Frame::AuthResponse {
                                    data: encode_b64(&answer),
                                })
                                .await?;
                        }
                        Frame::AuthSuccess => break,
                        Frame::AuthFailure { reason } => {
                            return Err(WireError::AuthFailed(reason));
                        }
                        other => return Err(Self::off_script("AUTH_SUCCESS", &other)),
                    }
                }
                match self.read_timed("FEATURES").await? {
                    Frame::Features { features } => self.features = features,
                    other => return Err(Self::off_script("FEATURES", &other)),
                }
                Ok(TransitionOutcome::Success)
            }

            StateId::Compressed => {
                self.stream.write_frame(&Frame::Compress).await?;
                match self.read_timed("COMPRESS_ACK").await? {
                    Frame::CompressAck => {
                        self.stream.enable_compression();
                        Ok(TransitionOutcome::Success)
                    }
                    other => Err(Self::off_script("COMPRESS_ACK", &other)),
                }
            }

            StateId::Bound => {
                self.stream
                    .write_frame(&Frame::Bind { resource: None })
                    .await?;
                match self.read_timed("BOUND").await? {
                    Frame::Bound { address } => {
                        tracing::debug!(%address, "resource bound");
                        self.address = Some(address);
                        Ok(TransitionOutcome::Success)
                    }
                    other => Err(Self::off_script("BOUND", &other)),
                }
            }

            StateId::StreamResumed => {
                let Some(state) = self.resume.clone() else {
                    return Ok(TransitionOutcome::Impossible(
                        "no resumption token".to_string(),
                    ));
                };
                self.stream
                    .write_frame(&Frame::SmResume {
                        token: state.token.clone(),
                        h: state.ledger.received(),
                    })
                    .await?;
                match self.read_timed("SM_RESUMED").await? {
                    Frame::SmResumed { h } => {
                        self.complete_resumption(state, h, None).await?;
                        Ok(TransitionOutcome::Success)
                    }
                    Frame::SmFailed { reason } => Ok(TransitionOutcome::Impossible(reason)),
                    other => Err(Self::off_script("SM_RESUMED", &other)),
                }
            }

            StateId::InstantResumed => {
                let Some(state) = self.resume.clone() else {
                    return Ok(TransitionOutcome::Impossible(
                        "no resumption token".to_string(),
                    ));
                };
                self.stream
                    .write_frame(&Frame::InstantResume {
                        token: state.token.clone(),
                        h: state.ledger.received(),
                    })
                    .await?;
                match self.read_timed("INSTANT_RESUMED").await? {
                    Frame::InstantResumed { h, address } => {
                        self.complete_resumption(state, h, Some(address)).await?;
                        Ok(TransitionOutcome::Success)
                    }
                    Frame::InstantRejected { reason } => {
                        Ok(TransitionOutcome::Impossible(reason))
                    }
                    other => Err(Self::off_script("INSTANT_RESUMED", &other)),
                }
            }
        }
    }

    /// Trim the carried ledger by the peer's count and replay whatever it
    /// never received, in original order, before steady-state traffic.
    async fn complete_resumption(
        &mut self,
        state: ResumeState,
        h: u32,
        address: Option<String>,
    ) -> Result<()> {
        let mut ledger = state.ledger;
        ledger.apply_ack(h)?;
        let replay = ledger.unacked_stanzas();
        if !replay.is_empty() {
            tracing::debug!(count = replay.len(), "replaying unacknowledged stanzas");
        }
        for stanza in replay {
            self.stream.write_frame(&Frame::Stanza { stanza }).await?;
        }
        self.ledger = Some(ledger);
        self.resume_token = Some(state.token);
        self.address = address;
        self.resumed = true;
        Ok(())
    }
}

impl StateSpace for Negotiator {
    fn feasible(&self, id: StateId) -> Feasibility {
        match id {
            StateId::Connected => Feasibility::Feasible,

            StateId::TlsSecured => {
                if !self.features.tls {
                    Feasibility::Impossible("peer does not offer tls".to_string())
                } else {
                    Feasibility::Feasible
                }
            }

            StateId::Authenticated => {
                if self.features.tls_required && !self.stream.is_secured() {
                    Feasibility::Impossible(
                        "peer requires tls before authentication".to_string(),
                    )
                } else if !self
                    .features
                    .mechanisms
                    .iter()
                    .any(|m| m == self.auth.name())
                {
                    Feasibility::Impossible(format!(
                        "peer does not offer mechanism {}",
                        self.auth.name()
                    ))
                } else {
                    Feasibility::Feasible
                }
            }

            StateId::Compressed => {
                if !self.features.compression {
                    Feasibility::Impossible("peer does not offer compression".to_string())
                } else {
                    Feasibility::Feasible
                }
            }

            StateId::Bound => Feasibility::Feasible,

            StateId::StreamResumed => {
                if self.resume.is_none() {
                    Feasibility::Impossible("no resumption token".to_string())
                } else if !self.features.stream_management {
                    Feasibility::Impossible(
                        "peer does not offer stream management".to_string(),
                    )
                } else {
                    Feasibility::Feasible
                }
            }

            StateId::InstantResumed => {
                if self.resume.is_none() {
                    Feasibility::Impossible("no resumption token".to_string())
                } else if !self.features.instant_resume {
                    Feasibility::Impossible(
                        "peer does not offer instant resumption".to_string(),
                    )
                } else {
                    Feasibility::Feasible
                }
            }
        }
    }

    fn enter(&mut self, id: StateId) -> impl Future<Output = TransitionOutcome> + Send {
        async move {
            match self.try_enter(id).await {
                Ok(outcome) => outcome,
                Err(error) => TransitionOutcome::Fatal(error),
            }
        }
    }
}
