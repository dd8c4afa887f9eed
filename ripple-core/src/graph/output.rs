//! Node Outputs
//!
//! Every node publishes an [`Output`]: either a present value or absent.
//! Absent is an ordinary result, not an error. It propagates through the graph
//! until a node with a fallback substitutes something else.
//!
//! The arena stores outputs type-erased behind [`AnyOutput`] so nodes of
//! different output types can share one slot collection.

use std::any::Any;
use std::fmt::Debug;

use crate::error::{GraphError, GraphResult};

/// Types that can flow along graph edges.
pub trait Value: Clone + Debug + 'static {}

impl<T> Value for T where T: Clone + Debug + 'static {}

/// A tagged optional node output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Output<T> {
    /// The node produced a value.
    Present(T),

    /// The node produced nothing.
    #[default]
    Absent,
}

impl<T> Output<T> {
    /// Whether a value is present.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// Whether the output is absent.
    pub fn is_absent(&self) -> bool {
        !self.is_present()
    }

    /// Borrow the value, failing with [`GraphError::NoOutputValue`] if absent.
    pub fn value(&self) -> GraphResult<&T> {
        match self {
            Self::Present(value) => Ok(value),
            Self::Absent => Err(GraphError::NoOutputValue),
        }
    }

    /// Take the value, failing with [`GraphError::NoOutputValue`] if absent.
    pub fn into_value(self) -> GraphResult<T> {
        match self {
            Self::Present(value) => Ok(value),
            Self::Absent => Err(GraphError::NoOutputValue),
        }
    }

    /// Convert to an `Option`.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent => None,
        }
    }

    /// Borrow as `Output<&T>`.
    pub fn as_ref(&self) -> Output<&T> {
        match self {
            Self::Present(value) => Output::Present(value),
            Self::Absent => Output::Absent,
        }
    }

    /// Map a present value.
    pub fn map<U, F>(self, f: F) -> Output<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Present(value) => Output::Present(f(value)),
            Self::Absent => Output::Absent,
        }
    }
}

impl<T> From<T> for Output<T> {
    fn from(value: T) -> Self {
        Self::Present(value)
    }
}

impl<T> From<Option<T>> for Output<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Self::Present)
    }
}

/// Type-erased output slot stored in the node arena.
pub(crate) trait AnyOutput: Any {
    fn is_present(&self) -> bool;

    /// Render the output for events and node enumeration.
    fn display(&self) -> Output<String>;

    /// Overwrite this output with `other`, which must have the same concrete type.
    fn copy_from(&mut self, other: &dyn AnyOutput);

    /// Reset to absent.
    fn clear(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Value> AnyOutput for Output<T> {
    fn is_present(&self) -> bool {
        Output::is_present(self)
    }

    fn display(&self) -> Output<String> {
        self.as_ref().map(|value| format!("{value:?}"))
    }

    fn copy_from(&mut self, other: &dyn AnyOutput) {
        match other.as_any().downcast_ref::<Output<T>>() {
            Some(other) => self.clone_from(other),
            None => debug_assert!(false, "fallback output type mismatch"),
        }
    }

    fn clear(&mut self) {
        *self = Output::Absent;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
