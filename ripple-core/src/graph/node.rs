//! Graph Nodes
//!
//! This module defines the node contract and the arena entries nodes live in.
//!
//! # Ownership
//!
//! The graph owns every node in an arena of [`Slot`]s keyed by [`NodeId`].
//! User code only ever holds handles: a [`Node`] to read outputs and fire,
//! and a [`Dep`] inside a compute type to read a declared dependency. Both
//! carry a weak graph reference, so the graph is torn down as a unit when the
//! last [`Graph`](super::Graph) handle is dropped.

use std::any::{type_name, TypeId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::dependency::{Context, Dep};
use super::events::{ListenerId, Listeners};
use super::output::{AnyOutput, Output, Value};
use super::{Graph, GraphInner};
use crate::error::{GraphError, GraphResult};
use crate::inspect::Structure;

/// Unique identifier for a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    /// Generate a new unique graph ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for a node.
///
/// Ids embed the owning graph, so a node from one graph can never be mistaken
/// for a node of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    graph: GraphId,
    index: u32,
}

impl NodeId {
    pub(crate) fn new(graph: GraphId, index: u32) -> Self {
        Self { graph, index }
    }

    /// The graph this node belongs to.
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// Registration index within the graph.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}n{}", self.graph.0, self.index)
    }
}

/// The computation behind a node.
///
/// `compute` runs only while the graph evaluates this node, and only when
/// every dependency other than the fallback has a present output. It must be
/// a pure function of its dependency values and its own state, reading other
/// nodes exclusively through [`Dep`] handles.
///
/// The [`Structure`] supertrait describes the type's fields to the legality
/// inspector; see [`structure!`](crate::structure).
pub trait Compute: Structure {
    /// The value type this node produces.
    type Output: Value;

    /// Produce the node's new output.
    fn compute(&mut self, cx: &mut Context<'_>) -> GraphResult<Output<Self::Output>>;
}

/// Anything that can be declared as a dependency.
pub trait Producer {
    /// The producer's output type.
    type Output: Value;

    /// The underlying node handle.
    fn node(&self) -> &Node<Self::Output>;
}

/// Type-erased compute stored in a slot.
pub(crate) trait Body {
    fn evaluate(
        &mut self,
        cx: &mut Context<'_>,
        output: &RefCell<Box<dyn AnyOutput>>,
    ) -> GraphResult<()>;
}

struct Erased<C>(C);

impl<C: Compute> Body for Erased<C> {
    fn evaluate(
        &mut self,
        cx: &mut Context<'_>,
        output: &RefCell<Box<dyn AnyOutput>>,
    ) -> GraphResult<()> {
        let value = self.0.compute(cx)?;
        let mut slot = output.borrow_mut();
        match slot.as_any_mut().downcast_mut::<Output<C::Output>>() {
            Some(slot) => *slot = value,
            None => debug_assert!(false, "output slot type mismatch"),
        }
        Ok(())
    }
}

/// An arena entry: one node's topology, bookkeeping and compute.
pub(crate) struct Slot {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) constant: bool,
    pub(crate) fallback: Option<NodeId>,

    /// Producers this node reads from.
    pub(crate) dependencies: RefCell<SmallVec<[NodeId; 4]>>,

    /// Nodes that read from this node.
    pub(crate) dependents: RefCell<SmallVec<[NodeId; 4]>>,

    pub(crate) output: RefCell<Box<dyn AnyOutput>>,
    pub(crate) body: RefCell<Box<dyn Body>>,

    /// Generation of the pass this node last fired in.
    pub(crate) last_fired: Cell<Option<u64>>,

    /// Index in the fire path, `None` for constant-output nodes or before priming.
    pub(crate) position: Cell<Option<usize>>,

    pub(crate) primed: Cell<bool>,
    pub(crate) listeners: Listeners<dyn Fn(&dyn AnyOutput)>,
}

impl Slot {
    pub(crate) fn has_fired_in(&self, generation: u64) -> bool {
        self.last_fired.get() == Some(generation)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("constant", &self.constant)
            .field("dependencies", &self.dependencies.borrow())
            .field("position", &self.position.get())
            .field("last_fired", &self.last_fired.get())
            .finish()
    }
}

struct Fallback {
    node: NodeId,
    type_id: TypeId,
    type_name: &'static str,
}

/// Declares a node's dependencies while it is being constructed.
///
/// Handed to the build closure of [`Graph::add`].
pub struct Wiring<'g> {
    graph: &'g Graph,
    id: NodeId,
    name: String,
    dependencies: SmallVec<[NodeId; 4]>,
    fallback: Option<Fallback>,
    constant: bool,
}

impl<'g> Wiring<'g> {
    pub(crate) fn new(graph: &'g Graph, id: NodeId, name: String) -> Self {
        Self {
            graph,
            id,
            name,
            dependencies: SmallVec::new(),
            fallback: None,
            constant: false,
        }
    }

    /// The id the node will be registered under.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare `producer` as a dependency and get the guarded handle to read it.
    pub fn depend_on<P: Producer>(&mut self, producer: &P) -> GraphResult<Dep<P::Output>> {
        let producer = producer.node();
        self.graph.inner().check_dependency(
            &self.name,
            &self.dependencies,
            self.constant,
            false,
            producer.id(),
        )?;
        self.dependencies.push(producer.id());
        Ok(Dep::new(producer.id(), self.id, Rc::downgrade(self.graph.inner())))
    }

    /// Use `producer`'s output whenever another dependency is absent.
    ///
    /// The fallback becomes a dependency too, so it is always evaluated first.
    /// The returned handle reads it like any other dependency.
    pub fn fallback<P: Producer>(&mut self, producer: &P) -> GraphResult<Dep<P::Output>> {
        if self.fallback.is_some() {
            return Err(GraphError::invalid_input(format!(
                "node '{}' already has a fallback",
                self.name
            )));
        }

        let id = producer.node().id();
        if !self.dependencies.contains(&id) {
            self.graph.inner().check_dependency(
                &self.name,
                &self.dependencies,
                self.constant,
                false,
                id,
            )?;
            self.dependencies.push(id);
        }

        self.fallback = Some(Fallback {
            node: id,
            type_id: TypeId::of::<P::Output>(),
            type_name: type_name::<P::Output>(),
        });
        Ok(Dep::new(id, self.id, Rc::downgrade(self.graph.inner())))
    }

    /// Fall back to a constant value, backed by an implicit constant node
    /// named `"<name> fallback"`.
    pub fn fallback_value<T: Value>(&mut self, value: T) -> GraphResult<()> {
        let constant = self.graph.constant(format!("{} fallback", self.name), value)?;
        self.fallback(&constant).map(|_| ())
    }

    /// Mark the node as constant-output: evaluated once at priming, never again.
    ///
    /// Constant-output nodes cannot have dependencies.
    pub fn constant_output(&mut self) -> GraphResult<()> {
        if !self.dependencies.is_empty() {
            return Err(GraphError::invalid_input(format!(
                "node '{}' has dependencies and cannot be constant-output",
                self.name
            )));
        }
        self.constant = true;
        Ok(())
    }

    pub(crate) fn into_slot<C: Compute>(self, compute: C) -> GraphResult<Slot> {
        if let Some(fallback) = &self.fallback {
            if fallback.type_id != TypeId::of::<C::Output>() {
                return Err(GraphError::invalid_input(format!(
                    "fallback of '{}' produces {} but the node produces {}",
                    self.name,
                    fallback.type_name,
                    type_name::<C::Output>()
                )));
            }
        }

        Ok(Slot {
            id: self.id,
            name: self.name,
            constant: self.constant,
            fallback: self.fallback.map(|fallback| fallback.node),
            dependencies: RefCell::new(self.dependencies),
            dependents: RefCell::new(SmallVec::new()),
            output: RefCell::new(Box::new(Output::<C::Output>::Absent)),
            body: RefCell::new(Box::new(Erased(compute))),
            last_fired: Cell::new(None),
            position: Cell::new(None),
            primed: Cell::new(false),
            listeners: Listeners::new(),
        })
    }
}

/// A handle to a node registered with a graph.
///
/// Handles are cheap to clone. They do not keep the graph alive.
pub struct Node<T> {
    id: NodeId,
    graph: Weak<GraphInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> Node<T> {
    pub(crate) fn new(id: NodeId, graph: Weak<GraphInner>) -> Self {
        Self {
            id,
            graph,
            _marker: PhantomData,
        }
    }

    pub(crate) fn graph(&self) -> GraphResult<Rc<GraphInner>> {
        self.graph.upgrade().ok_or(GraphError::GraphDropped)
    }

    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's name.
    pub fn name(&self) -> GraphResult<String> {
        Ok(self.graph()?.slot(self.id)?.name.clone())
    }

    /// The node's last output.
    ///
    /// Only legal while the graph is `Idle`; mid-pass the frontier is partially
    /// updated.
    pub fn output(&self) -> GraphResult<Output<T>> {
        self.graph()?.read_output(self.id)
    }

    /// Whether the node fired in the graph's latest pass.
    pub fn was_fired(&self) -> GraphResult<bool> {
        let graph = self.graph()?;
        let fired = graph.slot(self.id)?.has_fired_in(graph.generation());
        Ok(fired)
    }

    /// Generation of the pass this node last fired in.
    pub fn last_fired(&self) -> GraphResult<Option<u64>> {
        Ok(self.graph()?.slot(self.id)?.last_fired.get())
    }

    /// Position in the evaluation order; `None` before priming or for
    /// constant-output nodes.
    pub fn position(&self) -> GraphResult<Option<usize>> {
        Ok(self.graph()?.slot(self.id)?.position.get())
    }

    /// Whether the node was marked constant-output.
    pub fn is_constant(&self) -> GraphResult<bool> {
        Ok(self.graph()?.slot(self.id)?.constant)
    }

    /// The node's declared dependencies, in declaration order.
    pub fn dependencies(&self) -> GraphResult<Vec<NodeId>> {
        Ok(self.graph()?.slot(self.id)?.dependencies.borrow().to_vec())
    }

    /// Declare a dependency on an already registered node.
    ///
    /// Fails with [`GraphError::InvalidInput`] if the producer is from another
    /// graph, the graph is not building, this node is primed or constant-output,
    /// or the edge already exists. Cycles formed this way are reported by
    /// [`Graph::prime`].
    pub fn declare_dependency<P: Producer>(&self, producer: &P) -> GraphResult<Dep<P::Output>> {
        let graph = self.graph()?;
        let producer = producer.node().id();
        graph.declare_dependency(self.id, producer)?;
        Ok(Dep::new(producer, self.id, self.graph.clone()))
    }

    /// Fire a pass starting at this node.
    pub fn fire(&self) -> GraphResult<()> {
        self.graph()?.fire(self.id)
    }

    /// Register a callback run each time this node is evaluated, with its new output.
    pub fn on_fired<F>(&self, listener: F) -> GraphResult<ListenerId>
    where
        F: Fn(&Output<T>) + 'static,
    {
        let slot = self.graph()?.slot(self.id)?;
        let id = slot.listeners.add(Rc::new(move |output: &dyn AnyOutput| {
            if let Some(output) = output.as_any().downcast_ref::<Output<T>>() {
                listener(output);
            }
        }));
        Ok(id)
    }
}

impl<T: Value> Producer for Node<T> {
    type Output = T;

    fn node(&self) -> &Node<T> {
        self
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("output_type", &type_name::<T>())
            .finish()
    }
}

/// A read-only description of a node, for building node/edge snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub constant: bool,
    pub position: Option<usize>,
    pub dependencies: Vec<NodeId>,
    pub fallback: Option<NodeId>,
    /// Last output, rendered with `Debug`.
    pub output: Output<String>,
    pub last_fired: Option<u64>,
}

impl NodeInfo {
    pub(crate) fn from_slot(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            name: slot.name.clone(),
            constant: slot.constant,
            position: slot.position.get(),
            dependencies: slot.dependencies.borrow().to_vec(),
            fallback: slot.fallback,
            output: slot.output.borrow().display(),
            last_fired: slot.last_fired.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::compute_fn;
    use crate::GraphState;

    #[test]
    fn node_ids_embed_their_graph() {
        let a = GraphId::new();
        let b = GraphId::new();
        assert_ne!(a, b);
        assert_ne!(NodeId::new(a, 0), NodeId::new(b, 0));
        assert_eq!(NodeId::new(a, 3).index(), 3);
        assert_eq!(NodeId::new(a, 3).graph(), a);
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();

        let result = graph.add("twice", |w| {
            let first = w.depend_on(&source)?;
            w.depend_on(&source)?;
            Ok(compute_fn(move |_| first.output()))
        });

        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));
    }

    #[test]
    fn cross_graph_dependency_is_rejected() {
        let graph = Graph::new();
        let other = Graph::new();
        let foreign = other.source::<i32>("foreign").unwrap();

        let result = graph.add("local", |w| {
            let dep = w.depend_on(&foreign)?;
            Ok(compute_fn(move |_| dep.output()))
        });

        match result {
            Err(GraphError::InvalidInput { reason }) => assert!(reason.contains("different graph")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn late_declaration_after_priming_is_rejected() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();
        let sink = graph
            .add("sink", |_| Ok(compute_fn(|_| Ok(Output::Present(0)))))
            .unwrap();

        graph.prime().unwrap();
        assert!(matches!(
            sink.declare_dependency(&source),
            Err(GraphError::InvalidInput { .. })
        ));

        // Reopening the graph does not unprime the node.
        graph.disengage().unwrap();
        assert_eq!(graph.state(), GraphState::Building);
        match sink.declare_dependency(&source) {
            Err(GraphError::InvalidInput { reason }) => assert!(reason.contains("primed")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn late_declaration_wires_both_directions() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();
        let sink = graph
            .add("sink", |_| Ok(compute_fn(|_| Ok(Output::<i32>::Absent))))
            .unwrap();

        let dep = sink.declare_dependency(&source).unwrap();
        assert_eq!(dep.producer(), source.id());
        assert_eq!(sink.dependencies().unwrap(), vec![source.id()]);
        assert!(matches!(
            sink.declare_dependency(&source),
            Err(GraphError::InvalidInput { .. })
        ));
    }

    #[test]
    fn fallback_type_must_match() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();

        let result = graph.add("mismatch", |w| {
            let dep = w.depend_on(&source)?;
            w.fallback_value("text".to_string())?;
            Ok(compute_fn(move |_| dep.output()))
        });

        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));
    }

    #[test]
    fn failed_add_leaves_no_fallback_behind() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();

        let result = graph.add("safe", |w| {
            let dep = w.depend_on(&source)?;
            w.fallback_value("text".to_string())?;
            Ok(compute_fn(move |_| dep.output()))
        });
        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));
        assert_eq!(graph.node_count(), 1);
        let producer = graph.inner().slot(source.id()).unwrap();
        assert!(producer.dependents.borrow().is_empty());

        let safe = graph
            .add("safe", |w| {
                let dep = w.depend_on(&source)?;
                w.fallback_value(0)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();
        assert_eq!(graph.node_count(), 3);

        graph.prime().unwrap();
        assert_eq!(safe.output().unwrap(), Output::Present(0));
    }

    #[test]
    fn failed_build_rolls_back_nested_nodes() {
        let graph = Graph::new();

        let result = graph.add("outer", |w| {
            w.fallback_value(1)?;
            w.constant_output()?;
            Ok(compute_fn(|_| Ok(Output::Present(1))))
        });
        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));
        assert_eq!(graph.node_count(), 0);
        assert!(graph.constant("outer fallback", 2).is_ok());
    }

    #[test]
    fn constant_output_rejects_dependencies() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();

        let result = graph.add("constant", |w| {
            let dep = w.depend_on(&source)?;
            w.constant_output()?;
            Ok(compute_fn(move |_| dep.output()))
        });
        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));

        let result = graph.add("constant2", |w| {
            w.constant_output()?;
            let dep = w.depend_on(&source)?;
            Ok(compute_fn(move |_| dep.output()))
        });
        assert!(matches!(result, Err(GraphError::InvalidInput { .. })));
    }

    #[test]
    fn handles_report_dropped_graph() {
        let node = {
            let graph = Graph::new();
            graph.source::<i32>("orphan").unwrap().node().clone()
        };
        assert_eq!(node.output(), Err(GraphError::GraphDropped));
        assert_eq!(node.name(), Err(GraphError::GraphDropped));
    }
}
