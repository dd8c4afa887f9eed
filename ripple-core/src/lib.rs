//! Ripple Core
//!
//! This crate provides the core engine for Ripple, an in-process incremental
//! computation graph. It implements:
//!
//! - Nodes that compute an optional output from declared dependencies
//! - Fire path resolution with cycle detection and constant partitioning
//! - Firing, batching and refiring passes that only touch affected nodes
//! - A legality check that keeps node reads behind guarded dependency handles
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: The orchestrator, node arena, outputs and dependency handles
//! - `inspect`: Structural check for node references held outside a [`Dep`]
//! - `nodes`: Sources, constants, pulses and closure-backed computes
//! - `config`: Graph tunables
//! - `error`: The error type shared by every operation
//!
//! The engine is single-threaded and synchronous. Every call runs to
//! completion before returning, including any node computes and listeners it
//! triggers.
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::{compute_fn, Graph, Output};
//!
//! let graph = Graph::new();
//!
//! // Create a source
//! let count = graph.source::<i32>("count")?;
//!
//! // Create a derived node
//! let doubled = graph.add("doubled", |w| {
//!     let count = w.depend_on(&count)?;
//!     Ok(compute_fn(move |_| Ok(count.output()?.map(|n| n * 2))))
//! })?;
//!
//! // Bootstrap, then push a value through
//! graph.prime()?;
//! count.fire(5)?;
//!
//! assert_eq!(doubled.output()?, Output::Present(10));
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod inspect;
pub mod nodes;

pub use config::GraphConfig;
pub use error::{GraphError, GraphResult};
pub use graph::{
    Compute, Context, Dep, FiredEvent, Graph, GraphId, GraphState, ListenerId, Node, NodeId,
    NodeInfo, Output, Producer, Value, Wiring,
};
pub use inspect::{inspect, Member, Shape, ShapeKind, Structure};
pub use nodes::{compute_fn, ComputeFn, Source};
