//! Computation Graph
//!
//! This module implements the graph orchestrator: node registration, the
//! priming bootstrap, and the firing, batching and refiring passes.
//!
//! # Overview
//!
//! A graph is a DAG of nodes where an edge from B to A means A depends on B.
//! Priming resolves a fire path (a total order consistent with the edges) and
//! evaluates every node once. After that, firing a node evaluates it and then
//! walks the fire path from its position, evaluating each later node only if
//! one of its dependencies fired in the same pass.
//!
//! # Dirty Tracking
//!
//! Every pass increments a graph-wide generation counter, and every evaluated
//! node is stamped with the generation it fired in. "Did this fire in the
//! current pass" is a single comparison, and nothing needs clearing between
//! passes.
//!
//! # Re-entrancy
//!
//! All operations are synchronous and single-threaded. Node computes and
//! listeners run inside the orchestrator call that triggered them; the state
//! machine rejects anything they attempt that would disturb the pass.

mod dependency;
mod events;
mod node;
mod output;
mod scheduler;
mod state;

pub use dependency::{Context, Dep};
pub use events::{FiredEvent, ListenerId};
pub use node::{Compute, GraphId, Node, NodeId, NodeInfo, Producer, Wiring};
pub use output::{Output, Value};
pub use state::GraphState;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace, warn};

use crate::config::GraphConfig;
use crate::error::{GraphError, GraphResult};
use crate::inspect::inspect;
use dependency::Evaluating;
use events::GraphEvents;
use node::Slot;
use output::AnyOutput;
use scheduler::FirePath;

/// An incremental computation graph.
///
/// `Graph` is a cheap, clonable handle; clones share the same nodes. The graph
/// is torn down when the last `Graph` handle is dropped; node handles do not
/// keep it alive.
///
/// # Example
///
/// ```rust,ignore
/// let graph = Graph::new();
/// let celsius = graph.source::<f64>("celsius")?;
/// let fahrenheit = graph.add("fahrenheit", |w| {
///     let c = w.depend_on(&celsius)?;
///     Ok(compute_fn(move |_| Ok(c.output()?.map(|c| c * 9.0 / 5.0 + 32.0))))
/// })?;
///
/// graph.prime()?;
/// celsius.fire(100.0)?;
/// assert_eq!(fahrenheit.output()?, Output::Present(212.0));
/// ```
#[derive(Clone)]
pub struct Graph {
    inner: Rc<GraphInner>,
}

/// Shared graph state. Handles reach it through a `Weak` reference.
pub(crate) struct GraphInner {
    id: GraphId,
    config: GraphConfig,
    state: Cell<GraphState>,
    generation: Cell<u64>,
    next_index: Cell<u32>,

    /// Every registered node, in registration order.
    pub(crate) slots: RefCell<IndexMap<NodeId, Rc<Slot>>>,
    names: RefCell<HashMap<String, NodeId>>,
    path: RefCell<FirePath>,

    /// Nodes fired while a batch is open.
    pending: RefCell<IndexSet<NodeId>>,

    /// Nodes that asked for a follow-up pass during the current pass.
    refires: RefCell<IndexSet<NodeId>>,

    /// The node whose compute is running, if any.
    pub(crate) evaluating: Cell<Option<NodeId>>,
    primed_once: Cell<bool>,
    events: GraphEvents,
}

impl Graph {
    /// Create an empty graph with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    /// Create an empty graph.
    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            inner: Rc::new(GraphInner::new(config)),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<GraphInner> {
        &self.inner
    }

    /// This graph's id.
    pub fn id(&self) -> GraphId {
        self.inner.id
    }

    /// The current state.
    pub fn state(&self) -> GraphState {
        self.inner.state()
    }

    /// The current pass generation. Zero until the graph is first primed.
    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    /// The configuration the graph was created with.
    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    /// Register a node.
    ///
    /// `build` declares the node's dependencies on the supplied [`Wiring`] and
    /// returns its compute. Fails with [`GraphError::InvalidState`] unless the
    /// graph is `Building`, with [`GraphError::DuplicateNode`] if the name is
    /// taken, and with [`GraphError::IllegalNodeReference`] if the compute type
    /// holds a node outside a [`Dep`].
    ///
    /// Registration is all or nothing: if `build` or registration fails, any
    /// node `build` registered along the way (such as the constant behind
    /// [`Wiring::fallback_value`]) is removed again.
    pub fn add<C, F>(&self, name: impl Into<String>, build: F) -> GraphResult<Node<C::Output>>
    where
        C: Compute,
        F: FnOnce(&mut Wiring<'_>) -> GraphResult<C>,
    {
        let name = name.into();
        self.inner.ensure_state(GraphState::Building, "add a node")?;
        self.inner.ensure_unique(&name)?;
        if self.inner.config.inspect_nodes {
            inspect::<C>()?;
        }

        let mark = self.node_count();
        let id = self.inner.next_id();
        let mut wiring = Wiring::new(self, id, name);
        let registered = build(&mut wiring)
            .and_then(|compute| wiring.into_slot(compute))
            .and_then(|slot| self.inner.register(slot));
        if let Err(err) = registered {
            self.inner.rollback(mark);
            return Err(err);
        }

        Ok(Node::new(id, Rc::downgrade(&self.inner)))
    }

    /// Resolve the fire path and evaluate every node once.
    ///
    /// Legal only while `Building`. A cycle fails with
    /// [`GraphError::CycleDetected`] and leaves the graph `Building` with no
    /// order committed.
    pub fn prime(&self) -> GraphResult<()> {
        self.inner.prime()
    }

    /// Fire a pass starting at `producer`.
    ///
    /// While a batch is open the node is queued instead.
    pub fn fire<P: Producer>(&self, producer: &P) -> GraphResult<()> {
        let id = producer.node().id();
        if id.graph() != self.inner.id {
            return Err(GraphError::invalid_input(format!(
                "cannot fire {id}: it belongs to a different graph"
            )));
        }
        self.inner.fire(id)
    }

    /// Run `action` with firing deferred, then evaluate everything it fired in
    /// one pass.
    ///
    /// Each downstream node is evaluated at most once, however many of its
    /// sources were fired. If `action` fails the queued fires are dropped and
    /// the graph returns to `Idle`.
    pub fn batch<F>(&self, action: F) -> GraphResult<()>
    where
        F: FnOnce() -> GraphResult<()>,
    {
        self.inner.batch(action)
    }

    /// Reopen a primed graph for construction.
    ///
    /// Outputs and the generation are kept; the next [`Graph::prime`]
    /// recomputes the fire path to include any new nodes.
    pub fn disengage(&self) -> GraphResult<()> {
        self.inner.ensure_state(GraphState::Idle, "disengage")?;
        self.inner.set_state(GraphState::Building);
        debug!(generation = self.inner.generation(), "graph disengaged");
        Ok(())
    }

    /// Describe every node, in registration order. Legal only while `Idle`.
    pub fn nodes(&self) -> GraphResult<Vec<NodeInfo>> {
        self.inner.ensure_state(GraphState::Idle, "enumerate nodes")?;
        let slots = self.inner.slots.borrow();
        Ok(slots.values().map(|slot| NodeInfo::from_slot(slot)).collect())
    }

    /// Register a callback run whenever the state changes.
    pub fn on_state_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(GraphState) + 'static,
    {
        self.inner.events.state_changed.add(Rc::new(listener))
    }

    /// Register a callback run each time any node is evaluated.
    pub fn on_node_fired<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&FiredEvent) + 'static,
    {
        self.inner.events.node_fired.add(Rc::new(listener))
    }

    /// Register a callback run at the end of every prime, fire and batch,
    /// after any refire passes.
    pub fn on_pass_complete<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + 'static,
    {
        self.inner.events.pass_complete.add(Rc::new(listener))
    }

    /// Register a callback run once, after the first successful prime.
    pub fn on_primed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + 'static,
    {
        self.inner.events.primed.add(Rc::new(listener))
    }

    /// Remove a graph or node listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        if self.inner.events.remove(id) {
            return true;
        }
        let slots = self.inner.slots.borrow();
        slots.values().any(|slot| slot.listeners.remove(id))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("generation", &self.inner.generation())
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl GraphInner {
    fn new(config: GraphConfig) -> Self {
        Self {
            id: GraphId::new(),
            config,
            state: Cell::new(GraphState::Building),
            generation: Cell::new(0),
            next_index: Cell::new(0),
            slots: RefCell::new(IndexMap::new()),
            names: RefCell::new(HashMap::new()),
            path: RefCell::new(FirePath::default()),
            pending: RefCell::new(IndexSet::new()),
            refires: RefCell::new(IndexSet::new()),
            evaluating: Cell::new(None),
            primed_once: Cell::new(false),
            events: GraphEvents::new(),
        }
    }

    pub(crate) fn state(&self) -> GraphState {
        self.state.get()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    fn set_state(&self, state: GraphState) {
        let previous = self.state.replace(state);
        if previous != state {
            trace!(from = %previous, to = %state, "graph state changed");
            self.events.emit_state(state);
        }
    }

    fn ensure_state(&self, expected: GraphState, operation: &'static str) -> GraphResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(GraphError::invalid_state(operation, state))
        }
    }

    fn ensure_unique(&self, name: &str) -> GraphResult<()> {
        if self.names.borrow().contains_key(name) {
            return Err(GraphError::duplicate_node(name));
        }
        Ok(())
    }

    fn next_id(&self) -> NodeId {
        let index = self.next_index.get();
        self.next_index.set(index + 1);
        NodeId::new(self.id, index)
    }

    pub(crate) fn slot(&self, id: NodeId) -> GraphResult<Rc<Slot>> {
        if id.graph() != self.id {
            return Err(GraphError::invalid_input(format!(
                "node {id} belongs to a different graph"
            )));
        }
        self.slots
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| GraphError::invalid_input(format!("node {id} is not registered")))
    }

    fn register(&self, slot: Slot) -> GraphResult<()> {
        self.ensure_state(GraphState::Building, "add a node")?;
        self.ensure_unique(&slot.name)?;

        let producers = slot
            .dependencies
            .borrow()
            .iter()
            .map(|dep| self.slot(*dep))
            .collect::<GraphResult<Vec<_>>>()?;
        for producer in producers {
            producer.dependents.borrow_mut().push(slot.id);
        }

        trace!(
            node = %slot.name,
            id = %slot.id,
            dependencies = slot.dependencies.borrow().len(),
            constant = slot.constant,
            "node registered"
        );
        self.names.borrow_mut().insert(slot.name.clone(), slot.id);
        self.slots.borrow_mut().insert(slot.id, Rc::new(slot));
        Ok(())
    }

    /// Remove every node registered after the first `mark`, along with any
    /// edge that points at them.
    fn rollback(&self, mark: usize) {
        let removed: Vec<Rc<Slot>> = {
            let mut slots = self.slots.borrow_mut();
            if slots.len() <= mark {
                return;
            }
            slots.drain(mark..).map(|(_, slot)| slot).collect()
        };

        let ids: HashSet<NodeId> = removed.iter().map(|slot| slot.id).collect();
        {
            let mut names = self.names.borrow_mut();
            for slot in &removed {
                names.remove(&slot.name);
            }
        }
        for slot in self.slots.borrow().values() {
            slot.dependencies.borrow_mut().retain(|id| !ids.contains(&*id));
            slot.dependents.borrow_mut().retain(|id| !ids.contains(&*id));
        }
        debug!(nodes = removed.len(), "partial registration rolled back");
    }

    /// Validate a prospective edge from `producer` into the node named
    /// `consumer`.
    pub(crate) fn check_dependency(
        &self,
        consumer: &str,
        existing: &[NodeId],
        constant: bool,
        primed: bool,
        producer: NodeId,
    ) -> GraphResult<()> {
        if producer.graph() != self.id {
            return Err(GraphError::invalid_input(format!(
                "node '{consumer}' cannot depend on {producer}: it belongs to a different graph"
            )));
        }
        if self.state() != GraphState::Building {
            return Err(GraphError::invalid_input(format!(
                "node '{consumer}' cannot declare dependencies while the graph is {}",
                self.state()
            )));
        }
        if primed {
            return Err(GraphError::invalid_input(format!(
                "node '{consumer}' has already been primed"
            )));
        }
        if constant {
            return Err(GraphError::invalid_input(format!(
                "node '{consumer}' is constant-output and cannot have dependencies"
            )));
        }
        if existing.contains(&producer) {
            let producer = self.slot(producer)?;
            return Err(GraphError::invalid_input(format!(
                "node '{consumer}' already depends on '{}'",
                producer.name
            )));
        }
        self.slot(producer).map(|_| ())
    }

    /// Add an edge to an already registered node.
    pub(crate) fn declare_dependency(&self, consumer: NodeId, producer: NodeId) -> GraphResult<()> {
        let slot = self.slot(consumer)?;
        self.check_dependency(
            &slot.name,
            &slot.dependencies.borrow(),
            slot.constant,
            slot.primed.get(),
            producer,
        )?;

        slot.dependencies.borrow_mut().push(producer);
        self.slot(producer)?.dependents.borrow_mut().push(consumer);
        trace!(node = %slot.name, producer = %producer, "dependency declared");
        Ok(())
    }

    pub(crate) fn read_output<T: Value>(&self, id: NodeId) -> GraphResult<Output<T>> {
        self.ensure_state(GraphState::Idle, "read a node output")?;
        let slot = self.slot(id)?;
        Self::downcast(&slot)
    }

    pub(crate) fn read_dependency<T: Value>(
        &self,
        consumer: NodeId,
        producer: NodeId,
    ) -> GraphResult<Output<T>> {
        self.ensure_reading(consumer)?;
        let slot = self.slot(producer)?;
        Self::downcast(&slot)
    }

    fn downcast<T: Value>(slot: &Slot) -> GraphResult<Output<T>> {
        slot.output
            .borrow()
            .as_any()
            .downcast_ref::<Output<T>>()
            .cloned()
            .ok_or_else(|| {
                GraphError::invalid_input(format!(
                    "node '{}' does not produce {}",
                    slot.name,
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Dependencies may only be read by their consumer, while it is evaluated.
    pub(crate) fn ensure_reading(&self, consumer: NodeId) -> GraphResult<()> {
        let state = self.state();
        if !state.is_evaluating() || self.evaluating.get() != Some(consumer) {
            return Err(GraphError::invalid_state("read a dependency", state));
        }
        Ok(())
    }

    pub(crate) fn request_refire(&self, id: NodeId) -> GraphResult<()> {
        let state = self.state();
        if !state.is_evaluating() {
            return Err(GraphError::invalid_state("request a refire", state));
        }
        self.refires.borrow_mut().insert(id);
        Ok(())
    }

    /// Check that `id` may be fired right now, without firing it.
    pub(crate) fn ensure_can_fire(&self, id: NodeId) -> GraphResult<()> {
        let slot = self.slot(id)?;
        if slot.constant {
            return Err(GraphError::invalid_input(format!(
                "node '{}' is constant-output and cannot be fired",
                slot.name
            )));
        }
        match self.state() {
            GraphState::Idle | GraphState::Batching => Ok(()),
            state => Err(GraphError::invalid_state("fire a node", state)),
        }
    }

    fn begin_pass(&self, state: GraphState) {
        self.generation.set(self.generation.get() + 1);
        self.set_state(state);
    }

    fn prime(&self) -> GraphResult<()> {
        self.ensure_state(GraphState::Building, "prime the graph")?;

        let path = FirePath::resolve(&self.slots.borrow())?;
        let constants = {
            let slots = self.slots.borrow();
            for slot in slots.values() {
                slot.position.set(None);
            }
            for (position, id) in path.order().iter().enumerate() {
                if let Some(slot) = slots.get(id) {
                    slot.position.set(Some(position));
                }
            }
            path.constants()
                .iter()
                .filter_map(|id| slots.get(id))
                .filter(|slot| !slot.primed.get())
                .cloned()
                .collect::<Vec<_>>()
        };
        let order = path.order().to_vec();
        *self.path.borrow_mut() = path;

        self.begin_pass(GraphState::Priming);
        debug!(
            generation = self.generation(),
            nodes = order.len(),
            constants = constants.len(),
            "priming graph"
        );

        for slot in constants {
            self.evaluate(&slot)?;
        }
        for id in order {
            let slot = self.slot(id)?;
            self.evaluate(&slot)?;
        }

        self.finish_pass(true)
    }

    pub(crate) fn fire(&self, id: NodeId) -> GraphResult<()> {
        self.ensure_can_fire(id)?;

        if self.state() == GraphState::Batching {
            trace!(node = %id, "fire deferred to batch");
            self.pending.borrow_mut().insert(id);
            return Ok(());
        }

        self.begin_pass(GraphState::Firing);
        debug!(generation = self.generation(), node = %id, "firing");

        let mut fired = IndexSet::new();
        fired.insert(id);
        self.propagate(&fired)?;
        self.finish_pass(false)
    }

    fn batch<F>(&self, action: F) -> GraphResult<()>
    where
        F: FnOnce() -> GraphResult<()>,
    {
        self.ensure_state(GraphState::Idle, "start a batch")?;
        self.set_state(GraphState::Batching);

        if let Err(error) = action() {
            self.pending.borrow_mut().clear();
            self.set_state(GraphState::Idle);
            debug!(error = %error, "batch aborted");
            return Err(error);
        }

        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        if !pending.is_empty() {
            self.begin_pass(GraphState::Firing);
            debug!(
                generation = self.generation(),
                sources = pending.len(),
                "firing batch"
            );
            self.propagate(&pending)?;
        }
        self.finish_pass(false)
    }

    /// Run refires, return to `Idle` and publish the end of the pass.
    fn finish_pass(&self, primed: bool) -> GraphResult<()> {
        self.run_refires()?;
        self.set_state(GraphState::Idle);

        if primed && !self.primed_once.replace(true) {
            self.events.emit_primed();
        }
        self.events.emit_pass_complete();
        Ok(())
    }

    fn run_refires(&self) -> GraphResult<()> {
        let limit = self.config.refire_limit();
        let mut passes = 0;

        loop {
            let mut requested = std::mem::take(&mut *self.refires.borrow_mut());
            // Only nodes on the fire path can be refired.
            let slots = self.slots.borrow();
            requested.retain(|id| {
                slots
                    .get(id)
                    .is_some_and(|slot| slot.position.get().is_some())
            });
            drop(slots);

            let Some(first) = requested.first().copied() else {
                return Ok(());
            };

            if passes >= limit {
                let node = self.slot(first)?.name.clone();
                warn!(limit, node = %node, "refire limit exceeded");
                return Err(GraphError::RefireLimitExceeded { limit, node });
            }
            passes += 1;

            self.begin_pass(GraphState::Refiring);
            debug!(
                generation = self.generation(),
                nodes = requested.len(),
                pass = passes,
                "refiring"
            );
            self.propagate(&requested)?;
        }
    }

    /// Walk the fire path from the earliest of `fired`, evaluating each node
    /// that is in `fired` or has a dependency that fired this generation.
    fn propagate(&self, fired: &IndexSet<NodeId>) -> GraphResult<()> {
        let generation = self.generation();

        let mut start: Option<usize> = None;
        for id in fired {
            if let Some(position) = self.slot(*id)?.position.get() {
                start = Some(start.map_or(position, |start| start.min(position)));
            }
        }
        let Some(start) = start else {
            return Ok(());
        };

        let end = self.path.borrow().len();
        let mut evaluated = 0usize;
        for position in start..end {
            let Some(id) = self.path.borrow().get(position) else {
                break;
            };
            let slot = self.slot(id)?;
            if fired.contains(&id) || self.any_dependency_fired(&slot, generation)? {
                self.evaluate(&slot)?;
                evaluated += 1;
            }
        }

        trace!(generation, start, evaluated, "propagation finished");
        Ok(())
    }

    fn any_dependency_fired(&self, slot: &Slot, generation: u64) -> GraphResult<bool> {
        for dep in slot.dependencies.borrow().iter() {
            if self.slot(*dep)?.has_fired_in(generation) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dependencies_complete(&self, slot: &Slot) -> GraphResult<bool> {
        for dep in slot.dependencies.borrow().iter() {
            if Some(*dep) == slot.fallback {
                continue;
            }
            if !self.slot(*dep)?.output.borrow().is_present() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate one node: compute if its dependencies are complete, otherwise
    /// take the fallback's output. Then stamp it and notify listeners.
    fn evaluate(&self, slot: &Rc<Slot>) -> GraphResult<()> {
        let generation = self.generation();

        if self.dependencies_complete(slot)? {
            let _evaluating = Evaluating::enter(self, slot.id);
            let mut cx = Context::new(self, slot);
            slot.body.borrow_mut().evaluate(&mut cx, &slot.output)?;
        } else if let Some(fallback) = slot.fallback {
            let fallback = self.slot(fallback)?;
            let source = fallback.output.borrow();
            slot.output.borrow_mut().copy_from(&**source);
        } else {
            slot.output.borrow_mut().clear();
        }

        slot.last_fired.set(Some(generation));
        slot.primed.set(true);
        trace!(node = %slot.name, generation, "node fired");

        if !slot.listeners.is_empty() {
            let output = slot.output.borrow();
            for listener in slot.listeners.snapshot() {
                listener(&**output);
            }
        }

        if !self.events.node_fired.is_empty() {
            let event = FiredEvent {
                node: slot.id,
                name: slot.name.clone(),
                generation,
                output: slot.output.borrow().display(),
            };
            self.events.emit_fired(&event);
        }

        Ok(())
    }
}
