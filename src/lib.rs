//! # chatwire
//!
//! Connection-establishment engine for a federated instant-messaging wire
//! protocol. Establishing a session is not a fixed handshake script but a
//! walk over a directed graph of intermediate states (TLS upgrade,
//! authentication, compression, resource binding, resumption), where the
//! viable path depends on what the peer advertises, which optional
//! modules are enabled, and what failed earlier in the same attempt.
//!
//! ## Architecture
//!
//! ```text
//!  +-----------+     +-----------------------------+
//!  |  Session  |<----|  Connection::connect        |
//!  +-----+-----+     +--------------+--------------+
//!        |                          |
//!   reader task                 graph walk
//!   writer task            +--------+--------+
//!        |                 | Walker          |  candidate selection,
//!        v                 |   StateSpace    |  backtracking
//!  +-----------+          |     Negotiator  |  wire exchanges
//!  | transport |<----------+--------+--------+
//!  +-----------+                    |
//!    TCP / TLS / deflate       feasibility from
//!    newline-delimited JSON    peer features
//! ```
//!
//! Optional behavior lives in modules: each enabled module contributes
//! state descriptors to the graph, and the walker picks among feasible
//! candidates by declared precedence and priority, backtracking within an
//! attempt when an entry fails recoverably. Resumption states are
//! shortcuts: entering one ends the walk early with the previous session
//! restored.
//!
//! Delivery guarantees come from the stream-management ledger: both sides
//! count stanzas, acknowledgements trim a replay buffer, and a carried
//! ledger lets a resumed session replay exactly the stanzas the peer
//! never saw.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use chatwire::{Config, Connection, PlainAuth, Stanza};
//!
//! let config = Config::from_file("chatwire.toml")?.merge(Config::from_env());
//! let auth = Box::new(PlainAuth::new("alice", "hunter2"));
//!
//! let mut session = Connection::connect(&config, auth, None).await?;
//! session.send(Stanza::message("hello")).await?;
//!
//! // Later, after a network drop:
//! let resume = session.resume_state().await;
//! let auth = Box::new(PlainAuth::new("alice", "hunter2"));
//! let session = Connection::connect(&config, auth, resume).await?;
//! assert!(session.is_resumed());
//! ```
//!
//! ## Modules
//!
//! - [`graph`] — state descriptors, the walker, and the live negotiator
//! - [`ledger`] — stream-management counters and the replay buffer
//! - [`writer`] — backpressured outbound writer task
//! - [`session`] — connection establishment and the steady-state API
//! - [`transport`] — framed transport with TLS upgrade and compression
//! - [`auth`] — authentication mechanism seam
//! - [`frame`] — wire frames and stanzas
//! - [`config`] — file/env configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod frame;
pub mod graph;
pub mod ledger;
pub mod session;
pub mod transport;
pub mod writer;

pub use auth::{AuthMechanism, PlainAuth};
pub use config::{Config, DrainPolicy, EndpointConfig, ModulesConfig, TlsConfig, WriterConfig};
pub use error::{Result, WireError};
pub use frame::{Frame, PeerFeatures, Stanza, StanzaKind};
pub use graph::{
    DescriptorSet, Feasibility, NegotiationFailure, StateId, TransitionOutcome, Walker,
};
pub use ledger::{Ledger, ResumeState};
pub use session::{Connection, Session, SessionEvent};
pub use transport::{FrameStream, MemoryTransport, TcpTransport};
pub use writer::StanzaWriter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
