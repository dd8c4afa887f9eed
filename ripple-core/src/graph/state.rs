//! Graph States

use std::fmt;

/// The lifecycle state of a graph.
///
/// ```text
/// Building --prime--> Priming --> Idle <--> Firing / Batching / Refiring
///    ^                             |
///    +---------- disengage --------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    /// Before priming. The only state in which nodes and dependencies may be added.
    Building,

    /// The bootstrap pass is evaluating every node.
    Priming,

    /// Ready to fire. The only state in which node outputs may be read.
    Idle,

    /// A fire or batch pass is evaluating nodes.
    Firing,

    /// A batch is collecting fired sources. Nothing is evaluated yet.
    Batching,

    /// A follow-up pass is evaluating nodes that requested a refire.
    Refiring,
}

impl GraphState {
    /// Whether nodes are being evaluated in this state.
    ///
    /// Dependency values may only be read, and refires requested, while this holds.
    pub fn is_evaluating(self) -> bool {
        matches!(self, Self::Priming | Self::Firing | Self::Refiring)
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
