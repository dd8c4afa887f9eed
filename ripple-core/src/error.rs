//! Graph Errors
//!
//! Every failure the engine reports is a synchronous contract violation raised
//! at the point of the illegal call. Nothing is retried or deferred.

use thiserror::Error;

use crate::graph::GraphState;

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur while building, priming or firing a graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// An operation was attempted while the graph was in a state that forbids it.
    #[error("cannot {operation} while the graph is {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the graph was in.
        state: GraphState,
    },

    /// An illegal dependency declaration or node argument.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the input.
        reason: String,
    },

    /// Priming could not resolve a total evaluation order.
    #[error("cycle detected at node '{node}': {path}")]
    CycleDetected {
        /// A node that sits on the cycle.
        node: String,
        /// The cycle, rendered as `a -> b -> a`.
        path: String,
    },

    /// A node type holds a reference to another node outside a dependency handle.
    #[error("node type {node_type} holds an unguarded node reference at {path}")]
    IllegalNodeReference {
        /// The offending compute type.
        node_type: &'static str,
        /// Field path from the compute type to the node-shaped field.
        path: String,
    },

    /// An output slot was read while absent.
    #[error("output has no value")]
    NoOutputValue,

    /// A node name was registered twice with the same graph.
    #[error("a node named '{name}' is already registered with this graph")]
    DuplicateNode {
        /// The duplicated name.
        name: String,
    },

    /// Refire requests kept chaining past the configured bound.
    #[error("refire limit of {limit} passes exceeded (node '{node}' requested another)")]
    RefireLimitExceeded {
        /// The configured maximum number of refire passes.
        limit: usize,
        /// A node that requested the pass over the limit.
        node: String,
    },

    /// A node or dependency handle outlived its graph.
    #[error("the graph owning this node has been dropped")]
    GraphDropped,

    /// A node's compute operation failed.
    #[error("compute failed: {message}")]
    Compute {
        /// Description of the failure.
        message: String,
    },
}

impl GraphError {
    /// Creates an invalid state error for the given operation.
    pub fn invalid_state(operation: &'static str, state: GraphState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Creates a compute failure, for use inside [`Compute::compute`](crate::Compute::compute).
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    /// Creates a duplicate node error.
    pub fn duplicate_node(name: impl Into<String>) -> Self {
        Self::DuplicateNode { name: name.into() }
    }
}
