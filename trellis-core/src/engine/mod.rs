//! Engine
//!
//! [`Engine`] owns the graph of one document and is the only way callers
//! change it. Every mutation goes through the update scheduler, which runs
//! the inverse solver, settles the graph and reports what changed.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Action, Document, ElementDecl, Engine, Value};
//!
//! let document = Document::new(vec![
//!     ElementDecl::new("point").named("P1").with("x", 1.0).with("y", 2.0),
//!     ElementDecl::new("point").named("P2").bind("x", "$P1.y").bind("y", "$P1.x"),
//! ]);
//! let mut engine = Engine::new(&document).unwrap();
//!
//! let coords = engine.key("P1", "coords").unwrap();
//! engine
//!     .apply_action(Action::settled(coords, Value::numbers([-4.0, 9.0])))
//!     .unwrap();
//!
//! let p2 = engine.key("P2", "coords").unwrap();
//! assert_eq!(engine.value(&p2), Some(&Value::numbers([9.0, -4.0])));
//! ```

mod expander;
mod forward;
mod inverse;
mod scheduler;
pub mod worker;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::{Diagnostic, EngineError};
use crate::graph::{Element, ElementId, EssentialKey, Graph, Lookup, NodeKey, ScopeId};
use crate::registry::Registry;
use crate::value::Value;

use expander::{Expander, Site};
use forward::ForwardPass;
use scheduler::{HistoryEntry, TransientRun};

/// A request to move a node to a desired value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub target: NodeKey,
    pub value: Value,
    /// Transient actions (drags in progress) coalesce: each one replaces
    /// the effect of the previous transient action on the same target.
    #[serde(default)]
    pub transient: bool,
}

impl Action {
    pub fn settled(target: NodeKey, value: impl Into<Value>) -> Self {
        Self {
            target,
            value: value.into(),
            transient: false,
        }
    }

    pub fn transient(target: NodeKey, value: impl Into<Value>) -> Self {
        Self {
            target,
            value: value.into(),
            transient: true,
        }
    }
}

/// What one action did to the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// New values of every node whose value changed, ordered by key.
    pub changed: IndexMap<NodeKey, Value>,
    /// Nodes that no longer exist.
    pub removed: Vec<NodeKey>,
    pub diagnostics: Vec<Diagnostic>,
    /// Whether the target accepted the desired value.
    pub accepted: bool,
}

impl ActionOutcome {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.diagnostics.is_empty()
    }

    /// Fold a later outcome into this one. Later values win; a node removed
    /// and then re-created counts as changed.
    pub fn merge(&mut self, later: ActionOutcome) {
        for key in later.removed {
            self.changed.shift_remove(&key);
            if !self.removed.contains(&key) {
                self.removed.push(key);
            }
        }
        for (key, value) in later.changed {
            self.removed.retain(|k| k != &key);
            self.changed.insert(key, value);
        }
        self.diagnostics.extend(later.diagnostics);
        self.accepted = later.accepted;
    }
}

/// The reactive engine for one document.
pub struct Engine {
    graph: Graph,
    registry: Registry,
    config: EngineConfig,
    /// Diagnostics since the last [`Engine::take_diagnostics`].
    diagnostics: Vec<Diagnostic>,
    pending: Option<TransientRun>,
    history: Vec<Vec<HistoryEntry>>,
}

impl Engine {
    /// Build an engine over the standard element library with the default
    /// configuration.
    pub fn new(document: &Document) -> Result<Self, EngineError> {
        Self::with_registry(document, Registry::standard(), EngineConfig::default())
    }

    pub fn with_config(document: &Document, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_registry(document, Registry::standard(), config)
    }

    /// Build an engine with a custom element-type registry.
    ///
    /// Fails if the configuration is invalid, the document is malformed, or
    /// it names an element type the registry does not know.
    pub fn with_registry(
        document: &Document,
        registry: Registry,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        document.validate()?;
        if let Some(decl) = document.walk().find(|d| !registry.contains(&d.element_type)) {
            return Err(EngineError::UnknownElementType(decl.element_type.clone()));
        }

        let mut engine = Self {
            graph: Graph::new(),
            registry,
            config,
            diagnostics: Vec::new(),
            pending: None,
            history: Vec::new(),
        };
        for (index, decl) in document.children.iter().enumerate() {
            let mut expander = Expander::new(
                &mut engine.graph,
                &engine.registry,
                &engine.config,
                &mut engine.diagnostics,
            );
            expander.instantiate(decl, Site::top_level(index))?;
        }
        engine.settle();
        engine.graph.clear_changes();
        debug!(
            elements = engine.graph.element_ids().len(),
            nodes = engine.graph.node_count(),
            "engine ready"
        );
        Ok(engine)
    }

    /// Settle the graph and return the value of every node, ordered by key.
    pub fn evaluate_all(&mut self) -> IndexMap<NodeKey, Value> {
        self.settle();
        self.graph.clear_changes();
        let mut values: Vec<(NodeKey, Value)> = self
            .graph
            .node_ids()
            .into_iter()
            .filter_map(|id| self.graph.node(id))
            .map(|node| (node.key().clone(), node.value().clone()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values.into_iter().collect()
    }

    /// Bring one node up to date by pulling its producers.
    ///
    /// When the structure is unchanged this evaluates only what the node
    /// reads and leaves composites alone; otherwise it settles the whole
    /// graph first.
    pub fn evaluate(&mut self, key: &NodeKey) -> Result<Value, EngineError> {
        let Some(node_id) = self.graph.node_id(key) else {
            return Err(EngineError::UnknownNode(key.clone()));
        };
        if self.graph.needs_resolution() {
            self.settle();
            return self
                .graph
                .node_by_key(key)
                .map(|n| n.value().clone())
                .ok_or_else(|| EngineError::UnknownNode(key.clone()));
        }
        Ok(ForwardPass::new(&mut self.graph, &self.config, &mut self.diagnostics).evaluate(node_id))
    }

    /// Serialize the essential store and external values as MessagePack.
    ///
    /// Values are keyed by stable path, so a snapshot taken from one engine
    /// can be restored into another engine built from the same document.
    pub fn save_state(&self) -> Result<Vec<u8>, EngineError> {
        let snapshot = Snapshot {
            essentials: self
                .graph
                .essentials()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            externals: self
                .graph
                .externals()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };
        Ok(rmp_serde::to_vec_named(&snapshot)?)
    }

    // ── Lookups ─────────────────────────────────────────────────────

    /// The key of a variable of a top-level named element.
    ///
    /// Composites without the variable forward to their single replacement
    /// root, so `key("C", "x")` finds the `x` of whatever `C` copied.
    pub fn key(&self, name: &str, variable: &str) -> Option<NodeKey> {
        let element = self.element_named(name)?;
        let node = self.graph.variable_node(element, Some(variable))?;
        self.graph.node(node).map(|n| n.key().clone())
    }

    /// The element a top-level name refers to.
    pub fn element_named(&self, name: &str) -> Option<ElementId> {
        match self.graph.lookup(ScopeId::ROOT, name) {
            Lookup::Found(binding) => Some(binding.element),
            Lookup::Ambiguous | Lookup::Missing => None,
        }
    }

    /// Resolve a name as seen from inside an element.
    pub fn resolve_name(&self, from: ElementId, name: &str) -> Option<ElementId> {
        self.graph.resolve_name(from, name)
    }

    /// The current replacement roots of a composite, in item order.
    pub fn replacements(&self, composite: ElementId) -> Vec<ElementId> {
        self.graph
            .element(composite)
            .and_then(|e| e.composite.as_ref())
            .map(|state| state.replacements.values().map(|r| r.root).collect())
            .unwrap_or_default()
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.graph.element(id)
    }

    /// The element instantiated at a stable path such as `/0[2]/0`.
    pub fn element_at(&self, path: &str) -> Option<ElementId> {
        self.graph.element_at(path)
    }

    pub fn value(&self, key: &NodeKey) -> Option<&Value> {
        self.graph.node_by_key(key).map(|n| n.value())
    }

    /// The persisted value of an essential variable by stable path.
    pub fn essential(&self, path: &str, variable: &str) -> Option<&Value> {
        self.graph.essential(&EssentialKey::new(path, variable))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Whether a transient run is waiting for its settled action.
    pub fn has_pending_transient(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of committed actions that can be undone.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// On-disk form of [`Engine::save_state`].
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    essentials: Vec<(EssentialKey, Value)>,
    externals: Vec<(String, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Attribute, ElementDecl};
    use crate::error::Refusal;

    fn points() -> Document {
        Document::new(vec![
            ElementDecl::new("point").named("P1").with("x", 1.0).with("y", 2.0),
            ElementDecl::new("point")
                .named("P2")
                .bind("x", "$P1.y")
                .bind("y", "$P1.x"),
        ])
    }

    #[test]
    fn builds_and_evaluates() {
        let mut engine = Engine::new(&points()).unwrap();
        let p2 = engine.key("P2", "coords").unwrap();
        assert_eq!(engine.value(&p2), Some(&Value::numbers([2.0, 1.0])));
        let all = engine.evaluate_all();
        assert_eq!(all.get(&p2), Some(&Value::numbers([2.0, 1.0])));
        let keys: Vec<_> = all.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn unknown_types_fail_construction() {
        let document = Document::new(vec![ElementDecl::new("group").child(ElementDecl::new("blob"))]);
        assert!(matches!(
            Engine::new(&document),
            Err(EngineError::UnknownElementType(t)) if t == "blob"
        ));
    }

    #[test]
    fn ambiguous_names_are_reported_once_per_settle() {
        let document = Document::new(vec![
            ElementDecl::new("number").named("m").with("value", 1.0),
            ElementDecl::new("number").named("m").with("value", 2.0),
            ElementDecl::new("point").named("P").bind("x", "$m"),
            ElementDecl::new("number").named("n").with("value", 1.0),
            ElementDecl::new("repeat")
                .named("R")
                .bind("count", "$n")
                .child(ElementDecl::new("point")),
        ]);
        let ambiguous = |diagnostics: &[Diagnostic]| {
            diagnostics
                .iter()
                .filter(|d| matches!(d, Diagnostic::AmbiguousName { name, .. } if name == "m"))
                .count()
        };
        let mut engine = Engine::new(&document).unwrap();
        assert_eq!(ambiguous(engine.diagnostics()), 1);
        engine.take_diagnostics();

        // Still ambiguous after the structure moves: reported again, once.
        let n = engine.key("n", "value").unwrap();
        let outcome = engine
            .apply_action(Action::settled(n, Value::Number(3.0)))
            .unwrap();
        assert_eq!(ambiguous(&outcome.diagnostics), 1);
        assert_eq!(ambiguous(engine.diagnostics()), 1);
    }

    #[test]
    fn a_run_whose_target_stays_gone_is_dropped() {
        let document = Document::new(vec![
            ElementDecl::new("number").named("n").with("value", 2.0),
            ElementDecl::new("repeat")
                .named("R")
                .bind("count", "$n")
                .child(ElementDecl::new("point")),
        ]);
        let mut engine = Engine::new(&document).unwrap();
        let repeat = engine.element_named("R").unwrap();
        let point = engine.element(engine.replacements(repeat)[1]).unwrap().children[0];
        let target = NodeKey::new(point, "coords");
        engine
            .apply_action(Action::transient(target.clone(), Value::numbers([4.0, 4.0])))
            .unwrap();

        // Cut the repeat off while the run is open; halts are permanent.
        Expander::new(
            &mut engine.graph,
            &engine.registry,
            &engine.config,
            &mut engine.diagnostics,
        )
        .halt(repeat, "cut off".into());

        let outcome = engine
            .apply_action(Action::transient(target.clone(), Value::numbers([5.0, 5.0])))
            .unwrap();
        assert!(!outcome.accepted);
        assert!(outcome.removed.contains(&target));
        assert!(outcome.diagnostics.iter().any(|d| matches!(
            d,
            Diagnostic::InversionRefused { node, reason: Refusal::Absent } if node == &target
        )));
        assert!(!engine.has_pending_transient());
        assert_eq!(engine.history_len(), 0);
        assert!(matches!(
            engine.apply_action(Action::settled(target, Value::numbers([0.0, 0.0]))),
            Err(EngineError::UnknownNode(_))
        ));
    }

    #[test]
    fn malformed_documents_fail_construction() {
        let document = Document::new(vec![ElementDecl::new("point")
            .named("P")
            .attr("x", Attribute::reference("Q", Some("")))]);
        assert!(matches!(
            Engine::new(&document),
            Err(EngineError::InvalidDocument(_))
        ));
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = EngineConfig {
            max_expansion_rounds: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::with_config(&points(), config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn evaluate_rejects_unknown_keys() {
        let mut engine = Engine::new(&points()).unwrap();
        let key = NodeKey::new(ElementId::from(99), "x");
        assert!(matches!(engine.evaluate(&key), Err(EngineError::UnknownNode(_))));
    }

    #[test]
    fn merge_keeps_latest_values() {
        let a = NodeKey::new(ElementId::from(0), "x");
        let b = NodeKey::new(ElementId::from(1), "x");
        let mut first = ActionOutcome {
            changed: [(a.clone(), Value::Number(1.0))].into_iter().collect(),
            removed: vec![b.clone()],
            diagnostics: Vec::new(),
            accepted: true,
        };
        let second = ActionOutcome {
            changed: [(a.clone(), Value::Number(2.0)), (b.clone(), Value::Number(0.0))]
                .into_iter()
                .collect(),
            removed: Vec::new(),
            diagnostics: Vec::new(),
            accepted: false,
        };
        first.merge(second);
        assert_eq!(first.changed[&a], Value::Number(2.0));
        assert!(first.removed.is_empty());
        assert!(!first.accepted);
    }

    #[test]
    fn actions_deserialize_with_default_transient() {
        let action: Action = serde_json::from_str(
            r#"{"target": "e0.x", "value": {"type": "number", "value": 3.0}}"#,
        )
        .unwrap();
        assert!(!action.transient);
        assert_eq!(action.target, NodeKey::new(ElementId::from(0), "x"));
    }
}
