//! The state graph walker.
//!
//! Drives a connection attempt from the initial `connected` state to a
//! terminal state by repeatedly asking which successor descriptors are
//! feasible, ordering them, and attempting the best one. Shortcut edges
//! (instant resumption) need no special casing: they are ordinary successor
//! edges whose priority puts them first, and when their entry attempt turns
//! out impossible the ordinary step-continuation falls back to the nominal
//! path. That fallback is a design requirement, not an accident.
//!
//! The walk is single-threaded per attempt: one feasibility check or entry
//! attempt runs to completion before the next is considered, and the
//! [`WalkContext`] is never touched from more than one execution context.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use thiserror::Error;

use super::descriptor::{DescriptorSet, StateId};
use crate::error::WireError;

/// Result of attempting to enter a state.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The state was entered; it is now the current state
    Success,
    /// A precondition turned out unmet at entry time; the walker tries a
    /// sibling and never surfaces this
    Impossible(String),
    /// The step has no implementation; treated exactly like `Impossible`
    NotImplemented,
    /// I/O failure or protocol-level rejection; aborts the whole attempt
    Fatal(WireError),
}

/// Result of a pure feasibility check, before any entry I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feasibility {
    /// Worth attempting
    Feasible,
    /// Precondition unmet (feature disabled, not advertised by the peer)
    Impossible(String),
    /// No implementation behind the descriptor
    NotImplemented,
}

/// The seam between the walk algorithm and live protocol I/O.
///
/// Exhaustive matching over [`StateId`] inside implementations gives a
/// compile-time guarantee that every state supplies both a feasibility
/// check and an entry operation.
pub trait StateSpace {
    /// Pure query against current connection facts: could entering this
    /// state possibly succeed?
    fn feasible(&self, id: StateId) -> Feasibility;

    /// Attempt to enter the state, performing whatever I/O that takes.
    fn enter(&mut self, id: StateId) -> impl Future<Output = TransitionOutcome> + Send;
}

/// One entry in the ordered walk log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    /// Candidate discarded by its feasibility check
    RuledOut {
        /// The candidate
        id: StateId,
        /// Why it was discarded
        reason: String,
    },
    /// Entry attempt started
    Attempted {
        /// The candidate
        id: StateId,
    },
    /// Entry attempt came back impossible; candidate is failed for the
    /// rest of this attempt
    Rejected {
        /// The candidate
        id: StateId,
        /// Why entry was refused
        reason: String,
    },
    /// The state was entered
    Entered {
        /// The new current state
        id: StateId,
    },
}

/// Per-attempt walk bookkeeping. Created fresh for every connection
/// attempt and discarded with it; never shared.
#[derive(Debug, Default)]
pub struct WalkContext {
    visited: Vec<StateId>,
    failed: HashSet<StateId>,
    log: Vec<WalkEvent>,
}

impl WalkContext {
    fn new(start: StateId) -> Self {
        Self {
            visited: vec![start],
            failed: HashSet::new(),
            log: Vec::new(),
        }
    }

    /// States entered, in order, starting with the initial state
    pub fn visited(&self) -> &[StateId] {
        &self.visited
    }

    /// Whether the descriptor already failed an entry attempt this walk
    pub fn is_failed(&self, id: StateId) -> bool {
        self.failed.contains(&id)
    }

    /// The ordered log of considered, rejected, and entered transitions
    pub fn log(&self) -> &[WalkEvent] {
        &self.log
    }
}

/// How a connection attempt failed as a whole.
#[derive(Debug)]
pub enum FailureKind {
    /// I/O failure or protocol-level rejection at the named descriptor
    Fatal(WireError),
    /// The graph was exhausted without reaching a terminal state: a
    /// configuration/negotiation dead end, not an I/O error
    NoViablePath,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Fatal(e) => write!(f, "fatal: {e}"),
            FailureKind::NoViablePath => write!(f, "no viable path to a terminal state"),
        }
    }
}

/// A failed connection attempt: the descriptor at which it failed, the
/// failure kind, and the full walk log for diagnosis.
#[derive(Debug, Error)]
#[error("connection attempt failed at {at}: {kind}")]
pub struct NegotiationFailure {
    /// Descriptor at which the attempt failed
    pub at: StateId,
    /// Fatal error or dead end
    pub kind: FailureKind,
    /// Everything the walker tried and why it was rejected
    pub log: Vec<WalkEvent>,
}

/// A successful walk.
#[derive(Debug)]
pub struct Walk {
    /// The terminal state reached
    pub terminal: StateId,
    /// The walk bookkeeping, for diagnostics
    pub context: WalkContext,
}

/// Executes the constraint-satisfying graph walk against a [`StateSpace`].
pub struct Walker {
    set: DescriptorSet,
    start: StateId,
}

impl Walker {
    /// Create a walker over the given active descriptor set, starting at
    /// `connected`.
    pub fn new(set: DescriptorSet) -> Self {
        Self {
            set,
            start: StateId::Connected,
        }
    }

    /// The active descriptor set
    pub fn descriptors(&self) -> &DescriptorSet {
        &self.set
    }

    /// Walk from the initial state to a terminal state, or fail the whole
    /// attempt.
    ///
    /// Deterministic: for a fixed active set and a fixed sequence of
    /// feasibility/entry outcomes, the same path is selected every time.
    pub async fn run<S: StateSpace>(
        &self,
        space: &mut S,
    ) -> Result<Walk, NegotiationFailure> {
        let mut ctx = WalkContext::new(self.start);
        let mut current = self.start;

        loop {
            if self.set.get(current).is_some_and(|d| d.terminal) {
                tracing::debug!(state = %current, "negotiation complete");
                return Ok(Walk {
                    terminal: current,
                    context: ctx,
                });
            }

            // Step 1+2: candidates not already failed this attempt, filtered
            // by their pure feasibility checks.
            let mut feasible = Vec::new();
            for cand in self.set.successors_of(current) {
                if ctx.is_failed(cand) {
                    continue;
                }
                let implemented = self.set.get(cand).is_some_and(|d| d.implemented);
                if !implemented {
                    ctx.log.push(WalkEvent::RuledOut {
                        id: cand,
                        reason: "not implemented".to_string(),
                    });
                    continue;
                }
                match space.feasible(cand) {
                    Feasibility::Feasible => feasible.push(cand),
                    Feasibility::Impossible(reason) => {
                        tracing::trace!(state = %cand, %reason, "ruled out");
                        ctx.log.push(WalkEvent::RuledOut { id: cand, reason });
                    }
                    Feasibility::NotImplemented => {
                        ctx.log.push(WalkEvent::RuledOut {
                            id: cand,
                            reason: "not implemented".to_string(),
                        });
                    }
                }
            }

            // Step 3: precedence partial order, then priority.
            let ordered = self.set.order(&feasible);

            // Step 4: attempt candidates best-first.
            let mut entered = false;
            for cand in ordered {
                ctx.log.push(WalkEvent::Attempted { id: cand });
                match space.enter(cand).await {
                    TransitionOutcome::Success => {
                        tracing::debug!(from = %current, to = %cand, "entered state");
                        ctx.visited.push(cand);
                        ctx.log.push(WalkEvent::Entered { id: cand });
                        current = cand;
                        entered = true;
                        break;
                    }
                    TransitionOutcome::Impossible(reason) => {
                        tracing::debug!(state = %cand, %reason, "entry rejected");
                        ctx.failed.insert(cand);
                        ctx.log.push(WalkEvent::Rejected { id: cand, reason });
                    }
                    TransitionOutcome::NotImplemented => {
                        ctx.failed.insert(cand);
                        ctx.log.push(WalkEvent::Rejected {
                            id: cand,
                            reason: "not implemented".to_string(),
                        });
                    }
                    TransitionOutcome::Fatal(error) => {
                        tracing::warn!(state = %cand, %error, "fatal negotiation error");
                        return Err(NegotiationFailure {
                            at: cand,
                            kind: FailureKind::Fatal(error),
                            log: ctx.log,
                        });
                    }
                }
            }

            // Step 5: dead end.
            if !entered {
                tracing::warn!(state = %current, "no viable path");
                return Err(NegotiationFailure {
                    at: current,
                    kind: FailureKind::NoViablePath,
                    log: ctx.log,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModulesConfig;
    use crate::graph::descriptor::{Precedence, StateDescriptor};
    use std::collections::HashMap;

    /// Scripted environment: fixed feasibility answers and a queue of entry
    /// outcomes per state; records every entry attempt.
    #[derive(Default)]
    struct Scripted {
        feasibility: HashMap<StateId, Feasibility>,
        entries: HashMap<StateId, Vec<TransitionOutcome>>,
        attempts: Vec<StateId>,
    }

    impl Scripted {
        fn feasible_all() -> Self {
            Self::default()
        }

        fn set_feasibility(mut self, id: StateId, f: Feasibility) -> Self {
            self.feasibility.insert(id, f);
            self
        }

        fn on_enter(mut self, id: StateId, outcome: TransitionOutcome) -> Self {
            self.entries.entry(id).or_default().push(outcome);
            self
        }
    }

    impl StateSpace for Scripted {
        fn feasible(&self, id: StateId) -> Feasibility {
            self.feasibility
                .get(&id)
                .cloned()
                .unwrap_or(Feasibility::Feasible)
        }

        fn enter(&mut self, id: StateId) -> impl Future<Output = TransitionOutcome> + Send {
            self.attempts.push(id);
            let outcome = match self.entries.get_mut(&id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => TransitionOutcome::Success,
            };
            async move { outcome }
        }
    }

    fn default_walker(modules: &ModulesConfig) -> Walker {
        Walker::new(DescriptorSet::for_modules(modules).unwrap())
    }

    #[tokio::test]
    async fn test_nominal_path() {
        let modules = ModulesConfig {
            instant_resume: false,
            stream_management: false,
            ..Default::default()
        };
        let mut space = Scripted::feasible_all();
        let walk = default_walker(&modules).run(&mut space).await.unwrap();

        assert_eq!(walk.terminal, StateId::Bound);
        assert_eq!(
            walk.context.visited(),
            &[
                StateId::Connected,
                StateId::TlsSecured,
                StateId::Authenticated,
                StateId::Bound
            ]
        );
    }

    #[tokio::test]
    async fn test_shortcut_fallback_to_nominal_path() {
        // Instant resume looks feasible but its entry attempt is rejected by
        // the peer; the walk must still succeed via TLS→auth→bind.
        let mut space = Scripted::feasible_all()
            .set_feasibility(
                StateId::StreamResumed,
                Feasibility::Impossible("no token".to_string()),
            )
            .on_enter(
                StateId::InstantResumed,
                TransitionOutcome::Impossible("peer rejected token".to_string()),
            );
        let walk = default_walker(&ModulesConfig::default())
            .run(&mut space)
            .await
            .unwrap();

        assert_eq!(walk.terminal, StateId::Bound);
        // Shortcut tried first, then the nominal chain
        assert_eq!(
            space.attempts,
            vec![
                StateId::InstantResumed,
                StateId::TlsSecured,
                StateId::Authenticated,
                StateId::Bound
            ]
        );
        assert!(walk
            .context
            .log()
            .contains(&WalkEvent::Rejected {
                id: StateId::InstantResumed,
                reason: "peer rejected token".to_string()
            }));
    }

    #[tokio::test]
    async fn test_fatal_aborts_without_backtracking() {
        let mut space = Scripted::feasible_all()
            .set_feasibility(
                StateId::InstantResumed,
                Feasibility::Impossible("no token".to_string()),
            )
            .set_feasibility(
                StateId::StreamResumed,
                Feasibility::Impossible("no token".to_string()),
            )
            .on_enter(
                StateId::TlsSecured,
                TransitionOutcome::Fatal(WireError::Protocol("handshake garbage".to_string())),
            );
        let failure = default_walker(&ModulesConfig::default())
            .run(&mut space)
            .await
            .unwrap_err();

        assert_eq!(failure.at, StateId::TlsSecured);
        assert!(matches!(failure.kind, FailureKind::Fatal(_)));
        // No sibling was attempted after the fatal error
        assert_eq!(space.attempts, vec![StateId::TlsSecured]);
    }

    #[tokio::test]
    async fn test_no_viable_path_is_distinct_from_fatal() {
        let mut space = Scripted::feasible_all()
            .set_feasibility(
                StateId::InstantResumed,
                Feasibility::Impossible("no token".to_string()),
            )
            .set_feasibility(
                StateId::TlsSecured,
                Feasibility::Impossible("peer lacks tls".to_string()),
            )
            .set_feasibility(
                StateId::Authenticated,
                Feasibility::Impossible("no common mechanism".to_string()),
            );
        let failure = default_walker(&ModulesConfig::default())
            .run(&mut space)
            .await
            .unwrap_err();

        assert_eq!(failure.at, StateId::Connected);
        assert!(matches!(failure.kind, FailureKind::NoViablePath));
        // The earlier rejections are in the log for diagnosis
        assert!(failure
            .log
            .iter()
            .any(|e| matches!(e, WalkEvent::RuledOut { id: StateId::TlsSecured, .. })));
    }

    #[tokio::test]
    async fn test_disabled_module_never_attempted() {
        let modules = ModulesConfig {
            tls: false,
            instant_resume: false,
            stream_management: false,
            compression: false,
        };
        let mut space = Scripted::feasible_all();
        let walk = default_walker(&modules).run(&mut space).await.unwrap();

        assert_eq!(walk.terminal, StateId::Bound);
        assert!(!space.attempts.contains(&StateId::TlsSecured));
        assert!(!space.attempts.contains(&StateId::InstantResumed));
    }

    #[tokio::test]
    async fn test_determinism_same_path_twice() {
        let walker = default_walker(&ModulesConfig::default());
        let mut first = Scripted::feasible_all().set_feasibility(
            StateId::InstantResumed,
            Feasibility::Impossible("no token".to_string()),
        );
        let mut second = Scripted::feasible_all().set_feasibility(
            StateId::InstantResumed,
            Feasibility::Impossible("no token".to_string()),
        );

        let a = walker.run(&mut first).await.unwrap();
        let b = walker.run(&mut second).await.unwrap();
        assert_eq!(a.context.visited(), b.context.visited());
        assert_eq!(first.attempts, second.attempts);
    }

    #[tokio::test]
    async fn test_inferior_candidate_attempted_second() {
        // B declared inferior to A: A is always attempted first even with a
        // lower numeric priority.
        let set = DescriptorSet::from_descriptors(vec![
            StateDescriptor::new(StateId::Connected, 0)
                .with_successors([StateId::TlsSecured, StateId::Authenticated]),
            StateDescriptor::new(StateId::Authenticated, 10)
                .with_predecessors([StateId::Connected]),
            StateDescriptor::new(StateId::TlsSecured, 99)
                .terminal()
                .with_predecessors([StateId::Connected])
                .with_precedence([Precedence::InferiorTo(StateId::Authenticated)]),
        ])
        .unwrap();

        let mut space = Scripted::feasible_all().on_enter(
            StateId::Authenticated,
            TransitionOutcome::Impossible("refused".to_string()),
        );
        let walk = Walker::new(set).run(&mut space).await.unwrap();

        assert_eq!(
            space.attempts,
            vec![StateId::Authenticated, StateId::TlsSecured]
        );
        assert_eq!(walk.terminal, StateId::TlsSecured);
    }

    #[tokio::test]
    async fn test_unimplemented_descriptor_ruled_out() {
        let set = DescriptorSet::from_descriptors(vec![
            StateDescriptor::new(StateId::Connected, 0)
                .with_successors([StateId::TlsSecured, StateId::Bound]),
            StateDescriptor::new(StateId::TlsSecured, 99)
                .not_implemented()
                .with_predecessors([StateId::Connected]),
            StateDescriptor::new(StateId::Bound, 10)
                .terminal()
                .with_predecessors([StateId::Connected]),
        ])
        .unwrap();

        let mut space = Scripted::feasible_all();
        let walk = Walker::new(set).run(&mut space).await.unwrap();
        assert_eq!(walk.terminal, StateId::Bound);
        assert!(!space.attempts.contains(&StateId::TlsSecured));
    }
}
