//! Dependency Handles
//!
//! A [`Dep`] is the only sanctioned way for one node to observe another's
//! output. It is bound to one producer and one consumer, and dereferences
//! only while the graph is evaluating that consumer.
//!
//! The evaluation window is tracked with a guard that records the node being
//! evaluated and restores the previous one when dropped, so the window closes
//! even when a compute returns early with an error.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Weak;

use super::node::{NodeId, Slot};
use super::output::{Output, Value};
use super::state::GraphState;
use super::GraphInner;
use crate::error::{GraphError, GraphResult};

/// Guarded read access to a declared dependency.
pub struct Dep<T> {
    producer: NodeId,
    consumer: NodeId,
    graph: Weak<GraphInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> Dep<T> {
    pub(crate) fn new(producer: NodeId, consumer: NodeId, graph: Weak<GraphInner>) -> Self {
        Self {
            producer,
            consumer,
            graph,
            _marker: PhantomData,
        }
    }

    /// The producer's id.
    pub fn producer(&self) -> NodeId {
        self.producer
    }

    /// The consumer's id.
    pub fn consumer(&self) -> NodeId {
        self.consumer
    }

    /// The producer's current output.
    ///
    /// Fails with [`GraphError::InvalidState`] outside the consumer's own
    /// evaluation.
    pub fn output(&self) -> GraphResult<Output<T>> {
        let graph = self.graph.upgrade().ok_or(GraphError::GraphDropped)?;
        graph.read_dependency(self.consumer, self.producer)
    }

    /// The producer's current value.
    ///
    /// Fails like [`Dep::output`], and with [`GraphError::NoOutputValue`] if the
    /// producer has no value.
    pub fn value(&self) -> GraphResult<T> {
        self.output()?.into_value()
    }

    /// Whether the producer fired in the current pass.
    pub fn has_fired(&self) -> GraphResult<bool> {
        let graph = self.graph.upgrade().ok_or(GraphError::GraphDropped)?;
        graph.ensure_reading(self.consumer)?;
        let fired = graph.slot(self.producer)?.has_fired_in(graph.generation());
        Ok(fired)
    }
}

impl<T> Clone for Dep<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer,
            consumer: self.consumer,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Dep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep")
            .field("producer", &self.producer)
            .field("consumer", &self.consumer)
            .finish()
    }
}

/// What a node's compute can see of the graph while it is evaluated.
pub struct Context<'a> {
    graph: &'a GraphInner,
    node: &'a Slot,
}

impl<'a> Context<'a> {
    pub(crate) fn new(graph: &'a GraphInner, node: &'a Slot) -> Self {
        Self { graph, node }
    }

    /// The id of the node being evaluated.
    pub fn node(&self) -> NodeId {
        self.node.id
    }

    /// The name of the node being evaluated.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// The current pass generation.
    pub fn generation(&self) -> u64 {
        self.graph.generation()
    }

    /// The current graph state.
    pub fn state(&self) -> GraphState {
        self.graph.state()
    }

    /// Ask for this node to be evaluated again in a follow-up pass once the
    /// current pass completes.
    pub fn request_refire(&mut self) -> GraphResult<()> {
        self.graph.request_refire(self.node.id)
    }
}

/// Marks a node as the one being evaluated for the guard's lifetime.
pub(crate) struct Evaluating<'a> {
    graph: &'a GraphInner,
    previous: Option<NodeId>,
}

impl<'a> Evaluating<'a> {
    pub(crate) fn enter(graph: &'a GraphInner, node: NodeId) -> Self {
        let previous = graph.evaluating.replace(Some(node));
        Self { graph, previous }
    }
}

impl Drop for Evaluating<'_> {
    fn drop(&mut self) {
        self.graph.evaluating.set(self.previous);
    }
}
