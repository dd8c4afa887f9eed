//! Fire Path Resolution
//!
//! The fire path is the evaluation order of a primed graph. It is computed
//! once per priming and reused by every pass until the graph is reopened.
//!
//! # Algorithm
//!
//! Constant-output nodes are split off first. Their value can never change
//! after priming, so they stay out of the order and do not count towards
//! anyone's in-degree.
//!
//! The remaining nodes are sorted with Kahn's algorithm:
//!
//! 1. Count each node's non-constant dependencies
//! 2. Seed a FIFO queue with the zero-count nodes, in registration order
//! 3. Pop a node, append it to the order, and decrement its dependents
//! 4. Any dependent reaching zero joins the back of the queue
//!
//! Ties are broken by registration order and dependents are visited in the
//! order they declared the edge, so the same graph always yields the same path.
//! Nodes left over when the queue drains sit on or behind a cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::warn;

use super::node::{NodeId, Slot};
use crate::error::{GraphError, GraphResult};

/// The resolved evaluation order of a graph.
#[derive(Debug, Clone, Default)]
pub(crate) struct FirePath {
    order: Vec<NodeId>,
    constants: Vec<NodeId>,
}

impl FirePath {
    /// Resolve the fire path over every registered node.
    pub(crate) fn resolve(slots: &IndexMap<NodeId, Rc<Slot>>) -> GraphResult<Self> {
        let mut constants = Vec::new();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        for (id, slot) in slots {
            if slot.constant {
                constants.push(*id);
                continue;
            }

            let degree = slot
                .dependencies
                .borrow()
                .iter()
                .filter(|dep| slots.get(*dep).is_some_and(|dep| !dep.constant))
                .count();
            in_degree.insert(*id, degree);
            if degree == 0 {
                queue.push_back(*id);
            }
        }

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);

            if let Some(slot) = slots.get(&id) {
                for dependent in slot.dependents.borrow().iter() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if order.len() < in_degree.len() {
            return Err(Self::cycle_error(slots, &order));
        }

        Ok(Self { order, constants })
    }

    /// Walk unresolved dependencies from the first unresolved node until a
    /// node repeats. The repeated stretch is the cycle.
    fn cycle_error(slots: &IndexMap<NodeId, Rc<Slot>>, resolved: &[NodeId]) -> GraphError {
        let resolved: HashSet<NodeId> = resolved.iter().copied().collect();
        let unresolved = |id: &NodeId| {
            !resolved.contains(id) && slots.get(id).is_some_and(|slot| !slot.constant)
        };

        let mut walk: Vec<NodeId> = Vec::new();
        let mut current = slots.keys().copied().find(|id| unresolved(id));

        while let Some(id) = current {
            if let Some(start) = walk.iter().position(|seen| *seen == id) {
                walk.drain(..start);
                walk.push(id);
                break;
            }
            walk.push(id);
            current = slots
                .get(&id)
                .and_then(|slot| slot.dependencies.borrow().iter().copied().find(|dep| unresolved(dep)));
        }

        let name = |id: &NodeId| {
            slots
                .get(id)
                .map_or_else(|| id.to_string(), |slot| slot.name.clone())
        };
        let node = walk.first().map(name).unwrap_or_default();
        let path = walk.iter().map(name).collect::<Vec<_>>().join(" -> ");

        warn!(node = %node, path = %path, "dependency cycle rejected");
        GraphError::CycleDetected { node, path }
    }

    /// The node at `position`.
    pub(crate) fn get(&self, position: usize) -> Option<NodeId> {
        self.order.get(position).copied()
    }

    /// Number of ordinary nodes in the path.
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub(crate) fn constants(&self) -> &[NodeId] {
        &self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::compute_fn;
    use crate::{Graph, Output, Producer};

    fn resolve(graph: &Graph) -> GraphResult<FirePath> {
        FirePath::resolve(&graph.inner().slots.borrow())
    }

    #[test]
    fn dependencies_come_first() {
        let graph = Graph::new();
        let source = graph.source::<i32>("source").unwrap();
        let p1 = graph
            .add("p1", |w| {
                let dep = w.depend_on(&source)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();
        let p2 = graph
            .add("p2", |w| {
                let dep = w.depend_on(&p1)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();
        let p3 = graph
            .add("p3", |w| {
                let dep = w.depend_on(&source)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();

        let path = resolve(&graph).unwrap();

        assert_eq!(
            path.order(),
            &[source.node().id(), p1.id(), p3.id(), p2.id()]
        );
        assert!(path.constants().is_empty());
    }

    #[test]
    fn constants_are_partitioned_out() {
        let graph = Graph::new();
        let constant = graph.constant("one", 1).unwrap();
        let doubled = graph
            .add("doubled", |w| {
                let dep = w.depend_on(&constant)?;
                Ok(compute_fn(move |_| Ok(dep.output()?.map(|v| v * 2))))
            })
            .unwrap();

        let path = resolve(&graph).unwrap();

        assert_eq!(path.constants(), &[constant.id()]);
        assert_eq!(path.order(), &[doubled.id()]);
        assert_eq!(path.get(0), Some(doubled.id()));
        assert_eq!(path.get(1), None);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn cycle_names_its_members() {
        let graph = Graph::new();
        let a = graph
            .add("a", |_| Ok(compute_fn(|_| Ok(Output::Present(0)))))
            .unwrap();
        let b = graph
            .add("b", |w| {
                let dep = w.depend_on(&a)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();
        graph
            .add("downstream", |w| {
                let dep = w.depend_on(&b)?;
                Ok(compute_fn(move |_| dep.output()))
            })
            .unwrap();
        a.declare_dependency(&b).unwrap();

        match resolve(&graph) {
            Err(GraphError::CycleDetected { node, path }) => {
                assert_eq!(node, "a");
                assert_eq!(path, "a -> b -> a");
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let graph = Graph::new();
        let lonely = graph
            .add("lonely", |_| Ok(compute_fn(|_| Ok(Output::Present(0)))))
            .unwrap();
        lonely.declare_dependency(&lonely).unwrap();

        match resolve(&graph) {
            Err(GraphError::CycleDetected { node, path }) => {
                assert_eq!(node, "lonely");
                assert_eq!(path, "lonely -> lonely");
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }
}
