//! Graph Events
//!
//! Listeners are plain callbacks owned by the graph and invoked synchronously,
//! in registration order, from inside the orchestrator call that raised the
//! event.
//!
//! Listeners run while the graph is mid-transition. They may read state and
//! generation, but reading node outputs fails unless the graph is `Idle`, and
//! topology cannot change outside `Building` anyway.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::node::NodeId;
use super::output::Output;
use super::state::GraphState;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Published each time a node is evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredEvent {
    /// The evaluated node.
    pub node: NodeId,
    /// The node's name.
    pub name: String,
    /// The pass generation the node fired in.
    pub generation: u64,
    /// The new output, rendered with `Debug`.
    pub output: Output<String>,
}

/// An ordered listener list.
pub(crate) struct Listeners<F: ?Sized> {
    entries: RefCell<Vec<(ListenerId, Rc<F>)>>,
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Rc<F>) -> ListenerId {
        let id = ListenerId::new();
        self.entries.borrow_mut().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot the listeners so callbacks may register or remove listeners,
    /// or re-enter the graph, without tripping the borrow.
    pub(crate) fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect()
    }
}

/// All graph-level listener lists.
pub(crate) struct GraphEvents {
    pub(crate) state_changed: Listeners<dyn Fn(GraphState)>,
    pub(crate) node_fired: Listeners<dyn Fn(&FiredEvent)>,
    pub(crate) pass_complete: Listeners<dyn Fn()>,
    pub(crate) primed: Listeners<dyn Fn()>,
}

impl GraphEvents {
    pub(crate) fn new() -> Self {
        Self {
            state_changed: Listeners::new(),
            node_fired: Listeners::new(),
            pass_complete: Listeners::new(),
            primed: Listeners::new(),
        }
    }

    /// Remove a listener from whichever list holds it.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        self.state_changed.remove(id)
            || self.node_fired.remove(id)
            || self.pass_complete.remove(id)
            || self.primed.remove(id)
    }

    pub(crate) fn emit_state(&self, state: GraphState) {
        for listener in self.state_changed.snapshot() {
            listener(state);
        }
    }

    pub(crate) fn emit_fired(&self, event: &FiredEvent) {
        for listener in self.node_fired.snapshot() {
            listener(event);
        }
    }

    pub(crate) fn emit_pass_complete(&self) {
        for listener in self.pass_complete.snapshot() {
            listener();
        }
    }

    pub(crate) fn emit_primed(&self) {
        for listener in self.primed.snapshot() {
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn listener_ids_are_unique() {
        let id1 = ListenerId::new();
        let id2 = ListenerId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let events = GraphEvents::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Rc::clone(&log);
            events
                .state_changed
                .add(Rc::new(move |state: GraphState| log.borrow_mut().push((tag, state))));
        }

        events.emit_state(GraphState::Idle);

        assert_eq!(
            *log.borrow(),
            vec![
                ("first", GraphState::Idle),
                ("second", GraphState::Idle),
                ("third", GraphState::Idle),
            ]
        );
    }

    #[test]
    fn removed_listener_is_not_called() {
        let events = GraphEvents::new();
        let calls = Rc::new(Cell::new(0));

        let calls_clone = Rc::clone(&calls);
        let id = events
            .pass_complete
            .add(Rc::new(move || calls_clone.set(calls_clone.get() + 1)));

        events.emit_pass_complete();
        assert_eq!(calls.get(), 1);

        assert!(events.remove(id));
        assert!(!events.remove(id));

        events.emit_pass_complete();
        assert_eq!(calls.get(), 1);
    }
}
