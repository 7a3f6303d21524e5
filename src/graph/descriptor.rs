//! State descriptors: immutable declarations of negotiation steps.
//!
//! A descriptor declares one step's identity, priority, graph edges, and
//! precedence relations. It is pure data; the live behavior bound to a
//! descriptor for one connection attempt lives in
//! [`negotiate`](crate::graph::negotiate). Descriptors reference each other
//! by [`StateId`] handle, never by pointer, so the graph has no ownership
//! cycles.
//!
//! The active set for a connection attempt is a pure function of
//! [`ModulesConfig`]: a disabled module contributes none of its descriptors,
//! which makes every edge that references them dead. Construction validates
//! the set — duplicate identifiers and conflicting precedence relations are
//! configuration errors, rejected up front rather than resolved silently.

use std::collections::HashMap;
use std::fmt;

use crate::config::ModulesConfig;
use crate::error::{Result, WireError};

/// Identity of one negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateId {
    /// Transport established, nothing negotiated yet (initial state)
    Connected,
    /// TLS channel upgrade complete
    TlsSecured,
    /// Peer accepted our credentials
    Authenticated,
    /// Frame-level compression active
    Compressed,
    /// Resource bound; stream is fully usable (terminal)
    Bound,
    /// Previous stream resumed after re-authentication (terminal)
    StreamResumed,
    /// Previous stream resumed in one exchange, skipping auth and bind
    /// (terminal, shortcut)
    InstantResumed,
}

impl StateId {
    /// All identifiers, in declaration order
    pub const ALL: [StateId; 7] = [
        StateId::Connected,
        StateId::TlsSecured,
        StateId::Authenticated,
        StateId::Compressed,
        StateId::Bound,
        StateId::StreamResumed,
        StateId::InstantResumed,
    ];
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateId::Connected => "connected",
            StateId::TlsSecured => "tls-secured",
            StateId::Authenticated => "authenticated",
            StateId::Compressed => "compressed",
            StateId::Bound => "bound",
            StateId::StreamResumed => "stream-resumed",
            StateId::InstantResumed => "instant-resumed",
        };
        write!(f, "{name}")
    }
}

/// Ordering constraint between two descriptors that are feasible at the
/// same branch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    /// This descriptor must be attempted before the named one
    Before(StateId),
    /// This descriptor must be attempted after the named one
    After(StateId),
    /// This descriptor is strictly inferior to the named one: attempted
    /// only when the superior alternative has been ruled out
    InferiorTo(StateId),
}

/// Immutable declaration of one negotiation step.
#[derive(Debug, Clone)]
pub struct StateDescriptor {
    /// Stable identifier
    pub id: StateId,
    /// Tie-break among simultaneously feasible siblings; higher first
    pub priority: u8,
    /// Whether the step has an implementation; unimplemented descriptors
    /// are never attempted
    pub implemented: bool,
    /// Whether reaching this state completes the walk
    pub terminal: bool,
    /// Steps this one may directly follow
    pub predecessors: Vec<StateId>,
    /// Steps that may directly follow this one
    pub successors: Vec<StateId>,
    /// Ordering constraints against siblings
    pub precedence: Vec<Precedence>,
}

impl StateDescriptor {
    /// Create an implemented, non-terminal descriptor
    pub fn new(id: StateId, priority: u8) -> Self {
        Self {
            id,
            priority,
            implemented: true,
            terminal: false,
            predecessors: Vec::new(),
            successors: Vec::new(),
            precedence: Vec::new(),
        }
    }

    /// Mark as terminal
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Mark as declared-but-unimplemented
    pub fn not_implemented(mut self) -> Self {
        self.implemented = false;
        self
    }

    /// Set predecessor identifiers
    pub fn with_predecessors(mut self, predecessors: impl Into<Vec<StateId>>) -> Self {
        self.predecessors = predecessors.into();
        self
    }

    /// Set successor identifiers
    pub fn with_successors(mut self, successors: impl Into<Vec<StateId>>) -> Self {
        self.successors = successors.into();
        self
    }

    /// Set precedence relations
    pub fn with_precedence(mut self, precedence: impl Into<Vec<Precedence>>) -> Self {
        self.precedence = precedence.into();
        self
    }
}

/// The validated, immutable descriptor arena for one connection
/// configuration.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    descriptors: Vec<StateDescriptor>,
    index: HashMap<StateId, usize>,
}

impl DescriptorSet {
    /// Build the active set for the given module configuration.
    ///
    /// The graph:
    ///
    /// ```text
    ///                ┌──────────────────────────────────────┐
    ///                │ (shortcut)                           ▼
    /// connected ──> tls-secured ──> authenticated ──> instant-resumed*
    ///     │               │          │    │    │
    ///     └───────────────┴──────────┘    │    ├──> stream-resumed*
    ///        (tls module disabled)        │    │
    ///                                     ▼    ▼
    ///                             compressed ──> bound*
    ///                                     (* terminal)
    /// ```
    pub fn for_modules(modules: &ModulesConfig) -> Result<Self> {
        let mut descriptors = vec![
            StateDescriptor::new(StateId::Connected, 0).with_successors([
                StateId::InstantResumed,
                StateId::TlsSecured,
                StateId::Authenticated,
            ]),
            StateDescriptor::new(StateId::Authenticated, 70)
                .with_predecessors([StateId::Connected, StateId::TlsSecured])
                .with_successors([StateId::StreamResumed, StateId::Compressed, StateId::Bound]),
            StateDescriptor::new(StateId::Bound, 40)
                .terminal()
                .with_predecessors([StateId::Authenticated, StateId::Compressed]),
        ];

        if modules.tls {
            descriptors.push(
                StateDescriptor::new(StateId::TlsSecured, 80)
                    .with_predecessors([StateId::Connected])
                    .with_successors([StateId::Authenticated])
                    .with_precedence([Precedence::Before(StateId::Authenticated)]),
            );
        }
        if modules.compression {
            descriptors.push(
                StateDescriptor::new(StateId::Compressed, 50)
                    .with_predecessors([StateId::Authenticated])
                    .with_successors([StateId::Bound])
                    .with_precedence([Precedence::Before(StateId::Bound)]),
            );
        }
        if modules.stream_management {
            descriptors.push(
                StateDescriptor::new(StateId::StreamResumed, 60)
                    .terminal()
                    .with_predecessors([StateId::Authenticated])
                    .with_precedence([
                        Precedence::Before(StateId::Compressed),
                        Precedence::Before(StateId::Bound),
                    ]),
            );
        }
        if modules.instant_resume {
            descriptors.push(
                StateDescriptor::new(StateId::InstantResumed, 90)
                    .terminal()
                    .with_predecessors([StateId::Connected])
                    .with_precedence([Precedence::Before(StateId::TlsSecured)]),
            );
        }

        Self::from_descriptors(descriptors)
    }

    /// Build and validate a set from explicit descriptors.
    ///
    /// Rejects duplicate identifiers, dangling declared edges, and
    /// conflicting precedence relations (any cycle in the combined
    /// before/after/inferior order).
    pub fn from_descriptors(descriptors: Vec<StateDescriptor>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, desc) in descriptors.iter().enumerate() {
            if index.insert(desc.id, i).is_some() {
                return Err(WireError::Config(format!(
                    "duplicate state descriptor: {}",
                    desc.id
                )));
            }
        }

        let set = Self { descriptors, index };
        set.validate_edges()?;
        set.validate_precedence()?;
        Ok(set)
    }

    /// Whether the identifier is in the active set
    pub fn contains(&self, id: StateId) -> bool {
        self.index.contains_key(&id)
    }

    /// Look up a descriptor
    pub fn get(&self, id: StateId) -> Option<&StateDescriptor> {
        self.index.get(&id).map(|&i| &self.descriptors[i])
    }

    /// All active descriptors, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &StateDescriptor> {
        self.descriptors.iter()
    }

    /// Successors of `id` that exist in the active set.
    ///
    /// Edges to descriptors a disabled module would have contributed simply
    /// vanish here; the walker never sees them.
    pub fn successors_of(&self, id: StateId) -> Vec<StateId> {
        match self.get(id) {
            Some(desc) => desc
                .successors
                .iter()
                .copied()
                .filter(|s| self.contains(*s))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Order candidates for attempting: precedence relations form a partial
    /// order, numeric priority breaks ties.
    ///
    /// Deterministic: among unconstrained candidates the highest priority is
    /// picked first, then declaration order of [`StateId`]. The set was
    /// validated acyclic at construction, so every candidate gets placed.
    pub fn order(&self, candidates: &[StateId]) -> Vec<StateId> {
        let mut remaining: Vec<StateId> = candidates.to_vec();
        let mut ordered = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            // A candidate is ready when no other remaining candidate must
            // precede it.
            let mut ready: Vec<StateId> = remaining
                .iter()
                .copied()
                .filter(|&c| {
                    !remaining
                        .iter()
                        .any(|&other| other != c && self.precedes(other, c))
                })
                .collect();
            if ready.is_empty() {
                // Unreachable for a validated set; fall back to priority so
                // the walk still terminates.
                ready = remaining.clone();
            }
            ready.sort_by(|a, b| {
                let pa = self.get(*a).map_or(0, |d| d.priority);
                let pb = self.get(*b).map_or(0, |d| d.priority);
                pb.cmp(&pa).then(a.cmp(b))
            });
            let next = ready[0];
            remaining.retain(|&c| c != next);
            ordered.push(next);
        }

        ordered
    }

    /// Whether `a` must be attempted before `b` by declared relations
    fn precedes(&self, a: StateId, b: StateId) -> bool {
        let a_first = self.get(a).is_some_and(|d| {
            d.precedence.iter().any(|p| match p {
                Precedence::Before(x) => *x == b,
                Precedence::After(_) | Precedence::InferiorTo(_) => false,
            })
        });
        let b_after = self.get(b).is_some_and(|d| {
            d.precedence.iter().any(|p| match p {
                Precedence::After(x) | Precedence::InferiorTo(x) => *x == a,
                Precedence::Before(_) => false,
            })
        });
        a_first || b_after
    }

    /// Declared edges must be mirrored: every successor must list the source
    /// as a predecessor, among descriptors present in the set.
    fn validate_edges(&self) -> Result<()> {
        for desc in &self.descriptors {
            for succ in &desc.successors {
                if let Some(target) = self.get(*succ) {
                    if !target.predecessors.contains(&desc.id) {
                        return Err(WireError::Config(format!(
                            "descriptor {} lists successor {} which does not list it as predecessor",
                            desc.id, succ
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Conflicting precedence relations (a cycle in the combined order) are
    /// a configuration error, rejected rather than silently resolved.
    fn validate_precedence(&self) -> Result<()> {
        let ids: Vec<StateId> = self.descriptors.iter().map(|d| d.id).collect();

        // DFS cycle detection over the "must precede" relation
        for &start in &ids {
            let mut stack = vec![start];
            let mut seen = Vec::new();
            while let Some(current) = stack.pop() {
                for &next in &ids {
                    if next != current && self.precedes(current, next) {
                        if next == start {
                            return Err(WireError::Config(format!(
                                "conflicting precedence relations involving {start}"
                            )));
                        }
                        if !seen.contains(&next) {
                            seen.push(next);
                            stack.push(next);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
