//! Node Legality Inspection
//!
//! A node may only observe another node through a [`Dep`], which checks that
//! the read happens during the reader's own evaluation. Holding a [`Node`]
//! handle directly would let a compute read outputs behind the scheduler's
//! back, so compute types are checked for node-shaped fields when they are
//! first registered.
//!
//! # How It Works
//!
//! Types describe themselves through [`Structure::shape`]: opaque (nothing to
//! look inside), node-shaped, dependency-shaped, or a composite of named
//! members. The inspector walks the members depth first:
//!
//! 1. A node-shaped member fails with the path that reached it
//! 2. Dependency-shaped and opaque members end the walk on that branch
//! 3. Composites are expanded once per type, so recursive types terminate
//!
//! The verdict is cached per type for the lifetime of the thread.
//!
//! Closures are opaque. Anything a closure captures is not inspected.
//!
//! # Describing Your Own Types
//!
//! ```rust,ignore
//! struct Average {
//!     samples: Vec<Dep<f64>>,
//!     window: usize,
//! }
//!
//! ripple_core::structure!(Average {
//!     samples: Vec<Dep<f64>>,
//!     window: usize,
//! });
//! ```

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tracing::warn;

use crate::error::{GraphError, GraphResult};
use crate::graph::{Dep, Node, Output};

/// How a type is laid out, as far as node references are concerned.
#[derive(Debug, Clone)]
pub struct Shape {
    type_id: TypeId,
    name: &'static str,
    kind: ShapeKind,
}

/// The kinds of [`Shape`].
#[derive(Debug, Clone)]
pub enum ShapeKind {
    /// Cannot contain a node.
    Opaque,

    /// A node handle.
    Node,

    /// A dependency handle. Whatever it refers to is guarded.
    Dependency,

    /// A type with named members.
    Composite(Vec<Member>),
}

/// A named member of a composite shape.
#[derive(Debug, Clone)]
pub struct Member {
    name: Cow<'static, str>,
    shape: fn() -> Shape,
}

impl Shape {
    pub fn opaque<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(ShapeKind::Opaque)
    }

    pub fn node<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(ShapeKind::Node)
    }

    pub fn dependency<T: ?Sized + 'static>() -> Self {
        Self::of::<T>(ShapeKind::Dependency)
    }

    pub fn composite<T: ?Sized + 'static>(members: Vec<Member>) -> Self {
        Self::of::<T>(ShapeKind::Composite(members))
    }

    fn of<T: ?Sized + 'static>(kind: ShapeKind) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            kind,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The described type's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> &ShapeKind {
        &self.kind
    }
}

impl Member {
    /// A member whose shape is produced by `shape`.
    pub fn new(name: impl Into<Cow<'static, str>>, shape: fn() -> Shape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// A member of type `T`.
    pub fn of<T: Structure + ?Sized>(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, T::shape)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        (self.shape)()
    }
}

/// Types that can describe their layout to the inspector.
///
/// Every [`Compute`](crate::Compute) type implements this. Use the
/// [`structure!`](crate::structure) macro for plain structs.
pub trait Structure: 'static {
    fn shape() -> Shape;
}

thread_local! {
    static VERDICTS: RefCell<HashMap<TypeId, GraphResult<()>>> = RefCell::new(HashMap::new());
}

/// Check that no member reachable from `T` is node-shaped.
///
/// Fails with [`GraphError::IllegalNodeReference`] naming `T` and the member
/// path, for example `inputs[].some`.
pub fn inspect<T: Structure + ?Sized>() -> GraphResult<()> {
    let type_id = TypeId::of::<T>();
    if let Some(verdict) = VERDICTS.with(|verdicts| verdicts.borrow().get(&type_id).cloned()) {
        return verdict;
    }

    let verdict = walk(T::shape());
    if let Err(error) = &verdict {
        warn!(error = %error, "illegal node type");
    }
    VERDICTS.with(|verdicts| {
        verdicts.borrow_mut().insert(type_id, verdict.clone());
    });
    verdict
}

fn walk(root: Shape) -> GraphResult<()> {
    let mut visited = HashSet::new();
    visited.insert(root.type_id);

    let mut stack: Vec<(String, fn() -> Shape)> = Vec::new();
    if let ShapeKind::Composite(members) = &root.kind {
        push_members(&mut stack, "", members);
    }

    while let Some((path, shape)) = stack.pop() {
        let shape = shape();
        match &shape.kind {
            ShapeKind::Node => {
                return Err(GraphError::IllegalNodeReference {
                    node_type: root.name,
                    path,
                });
            }
            ShapeKind::Opaque | ShapeKind::Dependency => {}
            ShapeKind::Composite(members) => {
                if visited.insert(shape.type_id) {
                    push_members(&mut stack, &path, members);
                }
            }
        }
    }

    Ok(())
}

fn push_members(stack: &mut Vec<(String, fn() -> Shape)>, path: &str, members: &[Member]) {
    // Reversed so the first member is walked first.
    for member in members.iter().rev() {
        let path = if member.name == "[]" || path.is_empty() {
            format!("{path}{}", member.name)
        } else {
            format!("{path}.{}", member.name)
        };
        stack.push((path, member.shape));
    }
}

/// Implement [`Structure`] for concrete types.
///
/// With a field list the type is a composite of those fields; without one
/// each listed type is opaque.
///
/// ```rust,ignore
/// structure!(Scaled {
///     input: Dep<f64>,
///     factor: f64,
/// });
///
/// structure!(Celsius, Fahrenheit);
/// ```
#[macro_export]
macro_rules! structure {
    ($ty:ty { $($field:ident : $field_ty:ty),* $(,)? }) => {
        impl $crate::Structure for $ty {
            fn shape() -> $crate::Shape {
                $crate::Shape::composite::<Self>(vec![
                    $($crate::Member::of::<$field_ty>(stringify!($field))),*
                ])
            }
        }
    };
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Structure for $ty {
                fn shape() -> $crate::Shape {
                    $crate::Shape::opaque::<Self>()
                }
            }
        )+
    };
}

macro_rules! opaque {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Structure for $ty {
                fn shape() -> Shape {
                    Shape::opaque::<Self>()
                }
            }
        )*
    };
}

opaque!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    String, str, (), Duration,
);

macro_rules! wrapper {
    ($member:literal => $($ty:ident),* $(,)?) => {
        $(
            impl<T: Structure + ?Sized> Structure for $ty<T> {
                fn shape() -> Shape {
                    Shape::composite::<Self>(vec![Member::of::<T>($member)])
                }
            }
        )*
    };
}

wrapper!("inner" => Box, Rc, Arc, Cell, RefCell, Weak);

macro_rules! collection {
    ($($ty:ident),* $(,)?) => {
        $(
            impl<T: Structure> Structure for $ty<T> {
                fn shape() -> Shape {
                    Shape::composite::<Self>(vec![Member::of::<T>("[]")])
                }
            }
        )*
    };
}

collection!(Vec, VecDeque, BTreeSet);

impl<T: Structure> Structure for Option<T> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("some")])
    }
}

impl<T: Structure> Structure for Output<T> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("present")])
    }
}

impl<T: Structure> Structure for [T] {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("[]")])
    }
}

impl<T: Structure, const N: usize> Structure for [T; N] {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("[]")])
    }
}

impl<T: Structure, S: 'static> Structure for HashSet<T, S> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("[]")])
    }
}

impl<T: Structure, S: 'static> Structure for IndexSet<T, S> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<T>("[]")])
    }
}

impl<A> Structure for SmallVec<A>
where
    A: smallvec::Array + 'static,
    A::Item: Structure,
{
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<A::Item>("[]")])
    }
}

impl<K: Structure, V: Structure, S: 'static> Structure for HashMap<K, V, S> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<K>("key"), Member::of::<V>("value")])
    }
}

impl<K: Structure, V: Structure, S: 'static> Structure for IndexMap<K, V, S> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<K>("key"), Member::of::<V>("value")])
    }
}

impl<K: Structure, V: Structure> Structure for BTreeMap<K, V> {
    fn shape() -> Shape {
        Shape::composite::<Self>(vec![Member::of::<K>("key"), Member::of::<V>("value")])
    }
}

macro_rules! tuple {
    ($(($($name:ident : $index:literal),+)),* $(,)?) => {
        $(
            impl<$($name: Structure),+> Structure for ($($name,)+) {
                fn shape() -> Shape {
                    Shape::composite::<Self>(vec![$(Member::of::<$name>($index)),+])
                }
            }
        )*
    };
}

tuple!(
    (A: "0"),
    (A: "0", B: "1"),
    (A: "0", B: "1", C: "2"),
    (A: "0", B: "1", C: "2", D: "3"),
);

impl<T: ?Sized + 'static> Structure for PhantomData<T> {
    fn shape() -> Shape {
        Shape::opaque::<Self>()
    }
}

impl<T: 'static> Structure for Node<T> {
    fn shape() -> Shape {
        Shape::node::<Self>()
    }
}

impl<T: 'static> Structure for Dep<T> {
    fn shape() -> Shape {
        Shape::dependency::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaky {
        _label: String,
        _inputs: Vec<Option<Node<i32>>>,
    }

    structure!(Leaky {
        _label: String,
        _inputs: Vec<Option<Node<i32>>>,
    });

    struct Guarded {
        _inputs: Vec<Dep<i32>>,
        _lookup: HashMap<String, (u8, Dep<f64>)>,
    }

    structure!(Guarded {
        _inputs: Vec<Dep<i32>>,
        _lookup: HashMap<String, (u8, Dep<f64>)>,
    });

    struct Chain {
        _value: i64,
        _next: Option<Box<Chain>>,
    }

    structure!(Chain {
        _value: i64,
        _next: Option<Box<Chain>>,
    });

    struct Ping {
        _pong: Rc<Pong>,
    }

    struct Pong {
        _ping: Weak<Ping>,
        _sneaky: RefCell<Option<Node<u8>>>,
    }

    structure!(Ping { _pong: Rc<Pong> });
    structure!(Pong {
        _ping: Weak<Ping>,
        _sneaky: RefCell<Option<Node<u8>>>,
    });

    struct Marker;
    structure!(Marker);

    #[test]
    fn nested_node_is_reported_with_its_path() {
        match inspect::<Leaky>() {
            Err(GraphError::IllegalNodeReference { node_type, path }) => {
                assert!(node_type.ends_with("Leaky"));
                assert_eq!(path, "_inputs[].some");
            }
            other => panic!("expected IllegalNodeReference, got {other:?}"),
        }
    }

    #[test]
    fn dependency_handles_are_allowed() {
        assert_eq!(inspect::<Guarded>(), Ok(()));
    }

    #[test]
    fn recursive_types_terminate() {
        assert_eq!(inspect::<Chain>(), Ok(()));
    }

    #[test]
    fn mutually_recursive_types_are_walked() {
        match inspect::<Ping>() {
            Err(GraphError::IllegalNodeReference { path, .. }) => {
                assert_eq!(path, "_pong.inner._sneaky.inner.some");
            }
            other => panic!("expected IllegalNodeReference, got {other:?}"),
        }
    }

    #[test]
    fn opaque_types_pass() {
        assert_eq!(inspect::<Marker>(), Ok(()));
        assert_eq!(inspect::<(u8, String, [f64; 3])>(), Ok(()));
    }

    #[test]
    fn verdicts_are_cached() {
        let first = inspect::<Leaky>();
        assert!(first.is_err());
        assert!(VERDICTS.with(|verdicts| verdicts.borrow().contains_key(&TypeId::of::<Leaky>())));
        assert_eq!(inspect::<Leaky>(), first);
    }
}
