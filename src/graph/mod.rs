//! Connection-establishment state graph.
//!
//! A connection attempt is a walk over a directed graph of states:
//!
//! ```text
//!                +-------------+
//!                |  Connected  |
//!                +------+------+
//!        .--------------+---------------.
//!        v              v               v
//! +-------------+ +------------+ +---------------+
//! | TlsSecured  | | Authentic. | | InstantResumed|
//! +------+------+ +-----+------+ +---------------+
//!        |              |
//!        '------> +-----+------+
//!                 | Authentic. |
//!                 +-----+------+
//!           .-----------+-----------.
//!           v           v           v
//!    +------------+ +--------+ +-----------+
//!    | StreamRes. | | Compr. | |   Bound   |
//!    +------------+ +---+----+ +-----------+
//!                       |
//!                       v
//!                  +-----------+
//!                  |   Bound   |
//!                  +-----------+
//! ```
//!
//! [`descriptor`] declares the states and their edges, [`walker`] runs the
//! candidate-selection loop with backtracking, and [`negotiate`] performs
//! the actual wire exchanges when a state is entered. The walker knows
//! nothing about frames and the negotiator nothing about candidate
//! ordering; the [`walker::StateSpace`] trait is the seam between them.

pub mod descriptor;
pub mod negotiate;
pub mod walker;

pub use descriptor::{DescriptorSet, Precedence, StateDescriptor, StateId};
pub use negotiate::{Negotiated, Negotiator};
pub use walker::{
    Feasibility, FailureKind, NegotiationFailure, StateSpace, TransitionOutcome, Walk,
    WalkContext, WalkEvent, Walker,
};
