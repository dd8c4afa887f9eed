//! Fundamental Nodes
//!
//! The node kinds the engine itself relies on:
//!
//! - [`Source`]: an externally set value; firing it starts a pass
//! - constants: evaluated once at priming and never again
//! - pulses: emit a value for one pass, then fall back to a default
//! - [`compute_fn`]: any closure as a compute

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::trace;

use crate::error::GraphResult;
use crate::graph::{Compute, Context, Dep, Graph, Node, NodeId, Output, Producer, Value};
use crate::inspect::{Member, Shape, Structure};

/// A compute backed by a closure.
///
/// Closures are opaque to the legality inspector; read other nodes through
/// captured [`Dep`] handles only.
pub struct ComputeFn<F, T> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

/// Wrap a closure as a [`Compute`].
pub fn compute_fn<T, F>(f: F) -> ComputeFn<F, T>
where
    T: Value,
    F: FnMut(&mut Context<'_>) -> GraphResult<Output<T>> + 'static,
{
    ComputeFn {
        f,
        _marker: PhantomData,
    }
}

impl<F: 'static, T: 'static> Structure for ComputeFn<F, T> {
    fn shape() -> Shape {
        Shape::opaque::<Self>()
    }
}

impl<F, T> Compute for ComputeFn<F, T>
where
    T: Value,
    F: FnMut(&mut Context<'_>) -> GraphResult<Output<T>> + 'static,
{
    type Output = T;

    fn compute(&mut self, cx: &mut Context<'_>) -> GraphResult<Output<T>> {
        (self.f)(cx)
    }
}

/// A node whose value is set from outside the graph.
pub struct Source<T> {
    node: Node<T>,
    value: Rc<RefCell<Output<T>>>,
}

impl<T: Value> Source<T> {
    /// Set the value and fire a pass from this node.
    ///
    /// While a batch is open the pass is deferred to the end of the batch.
    /// Nothing is stored if the graph cannot fire right now.
    pub fn fire(&self, value: T) -> GraphResult<()> {
        self.fire_output(Output::Present(value))
    }

    /// Clear the value and fire a pass from this node.
    pub fn clear(&self) -> GraphResult<()> {
        self.fire_output(Output::Absent)
    }

    /// Set the output, present or absent, and fire a pass from this node.
    pub fn fire_output(&self, output: Output<T>) -> GraphResult<()> {
        let graph = self.node.graph()?;
        graph.ensure_can_fire(self.node.id())?;
        *self.value.borrow_mut() = output;
        graph.fire(self.node.id())
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// The underlying node handle.
    pub fn node(&self) -> &Node<T> {
        &self.node
    }
}

impl<T: Value> Producer for Source<T> {
    type Output = T;

    fn node(&self) -> &Node<T> {
        &self.node
    }
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            value: Rc::clone(&self.value),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("node", &self.node)
            .field("value", &self.value.borrow())
            .finish()
    }
}

impl<T: 'static> Structure for Source<T> {
    fn shape() -> Shape {
        Shape::node::<Self>()
    }
}

struct SourceBody<T> {
    value: Rc<RefCell<Output<T>>>,
}

impl<T: 'static> Structure for SourceBody<T> {
    fn shape() -> Shape {
        Shape::opaque::<Self>()
    }
}

impl<T: Value> Compute for SourceBody<T> {
    type Output = T;

    fn compute(&mut self, _cx: &mut Context<'_>) -> GraphResult<Output<T>> {
        Ok(self.value.borrow().clone())
    }
}

struct ConstantBody<T> {
    value: T,
}

impl<T: 'static> Structure for ConstantBody<T> {
    fn shape() -> Shape {
        Shape::opaque::<Self>()
    }
}

impl<T: Value> Compute for ConstantBody<T> {
    type Output = T;

    fn compute(&mut self, _cx: &mut Context<'_>) -> GraphResult<Output<T>> {
        Ok(Output::Present(self.value.clone()))
    }
}

struct PulseBody<T> {
    source: Dep<T>,
    default: T,
}

impl<T: 'static> Structure for PulseBody<T> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![
            Member::of::<Dep<T>>("source"),
            Member::new("default", Shape::opaque::<T>),
        ])
    }
}

impl<T: Value> Compute for PulseBody<T> {
    type Output = T;

    fn compute(&mut self, cx: &mut Context<'_>) -> GraphResult<Output<T>> {
        if self.source.has_fired()? {
            trace!(node = %cx.name(), "pulse raised");
            cx.request_refire()?;
            self.source.output()
        } else {
            Ok(Output::Present(self.default.clone()))
        }
    }
}

impl Graph {
    /// Register a source with no initial value.
    pub fn source<T: Value>(&self, name: impl Into<String>) -> GraphResult<Source<T>> {
        self.source_output(name, Output::Absent)
    }

    /// Register a source holding `initial` until it is first fired.
    pub fn source_with<T: Value>(&self, name: impl Into<String>, initial: T) -> GraphResult<Source<T>> {
        self.source_output(name, Output::Present(initial))
    }

    fn source_output<T: Value>(
        &self,
        name: impl Into<String>,
        initial: Output<T>,
    ) -> GraphResult<Source<T>> {
        let value = Rc::new(RefCell::new(initial));
        let body = SourceBody {
            value: Rc::clone(&value),
        };
        let node = self.add(name, move |_| Ok(body))?;
        Ok(Source { node, value })
    }

    /// Register a constant-output node.
    ///
    /// It is evaluated once, the first time the graph is primed, and cannot be
    /// fired.
    pub fn constant<T: Value>(&self, name: impl Into<String>, value: T) -> GraphResult<Node<T>> {
        self.add(name, move |w| {
            w.constant_output()?;
            Ok(ConstantBody { value })
        })
    }

    /// Register a node that emits `producer`'s output in passes where it fired,
    /// then emits `default` in the refire pass that follows.
    pub fn pulse<P: Producer>(
        &self,
        name: impl Into<String>,
        producer: &P,
        default: P::Output,
    ) -> GraphResult<Node<P::Output>> {
        self.add(name, move |w| {
            let source = w.depend_on(producer)?;
            Ok(PulseBody { source, default })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GraphError, GraphState};

    #[test]
    fn source_holds_its_initial_value() {
        let graph = Graph::new();
        let empty = graph.source::<i32>("empty").unwrap();
        let seeded = graph.source_with("seeded", 7).unwrap();
        graph.prime().unwrap();

        assert_eq!(empty.node().output().unwrap(), Output::Absent);
        assert_eq!(seeded.node().output().unwrap(), Output::Present(7));

        seeded.clear().unwrap();
        assert_eq!(seeded.node().output().unwrap(), Output::Absent);
    }

    #[test]
    fn rejected_fire_keeps_the_old_value() {
        let graph = Graph::new();
        let source = graph.source_with("source", 1).unwrap();

        assert!(matches!(
            source.fire(2),
            Err(GraphError::InvalidState {
                state: GraphState::Building,
                ..
            })
        ));

        graph.prime().unwrap();
        assert_eq!(source.node().output().unwrap(), Output::Present(1));
    }

    #[test]
    fn constant_is_evaluated_once() {
        let graph = Graph::new();
        let answer = graph.constant("answer", 42).unwrap();
        assert!(answer.is_constant().unwrap());

        graph.prime().unwrap();
        assert_eq!(answer.output().unwrap(), Output::Present(42));
        assert_eq!(answer.position().unwrap(), None);
        assert_eq!(answer.last_fired().unwrap(), Some(1));
    }

    #[test]
    fn pulse_resets_in_the_refire_pass() {
        let graph = Graph::new();
        let button = graph.source::<bool>("button").unwrap();
        let pulse = graph.pulse("click", &button, false).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = Rc::clone(&seen);
        pulse
            .on_fired(move |output| seen_clone.borrow_mut().push(output.clone()))
            .unwrap();

        graph.prime().unwrap();
        seen.borrow_mut().clear();

        button.fire(true).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![Output::Present(true), Output::Present(false)]
        );
        assert_eq!(pulse.output().unwrap(), Output::Present(false));
    }

    #[test]
    fn pulse_type_passes_inspection() {
        assert_eq!(crate::inspect::<PulseBody<i32>>(), Ok(()));
    }
}
