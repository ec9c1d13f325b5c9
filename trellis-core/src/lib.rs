//! Trellis Core
//!
//! A bidirectional reactive engine for interactive documents. A document is
//! a tree of elements; each element owns typed state variables. Variables
//! are either essential (they hold state) or derived (they are computed from
//! other variables). The engine implements:
//!
//! - Name and dependency resolution over nested scopes
//! - Forward evaluation in dependency order, with cycle detection
//! - Inversion: moving a derived variable moves the essentials behind it
//! - Composite expansion (`repeat`, `copy`, `conditional`, `collect`) with
//!   identity-preserving reconciliation
//! - Transient action coalescing, undo, and state snapshots
//!
//! # Architecture
//!
//! - `graph`: the node store, the element tree and the dependency resolver
//! - `registry`: element types and the standard element library
//! - `engine`: forward evaluator, inverse solver, composite expander, update
//!   scheduler, and the tokio worker
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Action, Document, ElementDecl, Engine, Value};
//!
//! // n points; dragging `n` down to zero and back restores them.
//! let document = Document::new(vec![
//!     ElementDecl::new("number").named("n").with("value", 2.0),
//!     ElementDecl::new("repeat")
//!         .named("R")
//!         .bind("count", "$n")
//!         .child(ElementDecl::new("point")),
//! ]);
//! let mut engine = Engine::new(&document).unwrap();
//!
//! let repeat = engine.element_named("R").unwrap();
//! assert_eq!(engine.replacements(repeat).len(), 2);
//!
//! let n = engine.key("n", "value").unwrap();
//! engine.apply_action(Action::settled(n, Value::Number(0.0))).unwrap();
//! assert!(engine.replacements(repeat).is_empty());
//! ```

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod graph;
pub mod registry;
pub mod value;

pub use config::EngineConfig;
pub use document::{Attribute, Document, ElementDecl};
pub use engine::worker::{spawn_worker, Command, EngineHandle, RenderUpdate};
pub use engine::{Action, ActionOutcome, Engine};
pub use error::{Diagnostic, EngineError, Refusal};
pub use graph::{ElementId, NodeKey};
pub use registry::{
    sole_modifiable, CompositeSpec, Derivation, Deps, ElementType, ExpansionMode, InverseResult,
    LogicalItem, Registry, StateVarSpec,
};
pub use value::{DepValue, Value};
