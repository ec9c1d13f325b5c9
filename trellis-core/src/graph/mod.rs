//! State-Variable Graph
//!
//! This module holds the node store: every element, every state-variable
//! node, the naming scopes, and the essential store.
//!
//! # Overview
//!
//! The graph is a flat arena. Nodes and elements are addressed by integer
//! ids and never by reference, so tearing down a replacement subtree is a
//! series of key removals rather than a pointer-graph walk.
//!
//! - Nodes keep their resolved edges (what they read) and a reverse index of
//!   dependents (who reads them).
//! - A structural epoch counts changes to the set of nameable entities. The
//!   resolver re-resolves every node's edges whenever the epoch moved.
//! - The essential store holds the value of every essential node keyed by
//!   the element's stable path. It outlives the nodes themselves, which is
//!   what lets a re-created replacement pick up its previous state.
//! - A change log records the value each node had before the current action
//!   touched it, so the scheduler can report exactly what changed.

mod dependency;
mod element;
mod node;
mod resolver;

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use dependency::{Dependency, EdgeTarget, ItemField, ResolvedEdge, Selector, Target};
pub use element::{
    Binding, BoundAttribute, CompositeState, Element, ElementId, ReplacementItem, Scope, ScopeId,
};
pub use node::{Node, NodeId, NodeKey, Validity};

use crate::registry::LogicalItem;
use crate::value::{DepValue, Value};

/// Key of a persisted essential value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EssentialKey {
    pub path: String,
    pub variable: String,
}

impl EssentialKey {
    pub fn new(path: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            variable: variable.into(),
        }
    }
}

/// Result of a scoped name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Binding),
    /// More than one element binds the name in the innermost scope.
    Ambiguous,
    Missing,
}

/// Values reported for one action: changed nodes and removed nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changed: IndexMap<NodeKey, Value>,
    pub removed: Vec<NodeKey>,
}

/// The graph of elements and state-variable nodes for one document.
#[derive(Debug, Default)]
pub struct Graph {
    elements: HashMap<ElementId, Element>,
    roots: Vec<ElementId>,
    nodes: HashMap<NodeId, Node>,
    index: HashMap<NodeKey, NodeId>,
    scopes: HashMap<ScopeId, Scope>,
    ids: HashMap<String, ElementId>,
    essentials: IndexMap<EssentialKey, Value>,
    externals: IndexMap<String, Value>,
    next_node: u64,
    next_element: u32,
    next_scope: Option<ScopeId>,
    epoch: u64,
    resolved_epoch: Option<u64>,
    /// Value each touched node had before the current action; `None` for
    /// nodes that did not exist.
    changes: IndexMap<NodeKey, Option<Value>>,
}

impl Graph {
    /// Create an empty graph with a root scope.
    pub fn new() -> Self {
        let mut graph = Self::default();
        graph.scopes.insert(ScopeId::ROOT, Scope::default());
        graph.next_scope = Some(ScopeId::ROOT.next());
        graph
    }

    // ── Elements ────────────────────────────────────────────────────

    /// Mint the element id for a stable path, reusing the id the path had
    /// before if it was ever instantiated.
    pub fn mint_element_id(&mut self, path: &str) -> ElementId {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }
        let id = ElementId::from(self.next_element);
        self.next_element += 1;
        self.ids.insert(path.to_string(), id);
        id
    }

    pub fn insert_element(&mut self, element: Element) {
        if element.parent.is_none() {
            self.roots.push(element.id);
        }
        self.elements.insert(element.id, element);
        self.epoch += 1;
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(&id)
    }

    pub fn contains_element(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Top-level elements in document order.
    pub fn roots(&self) -> &[ElementId] {
        &self.roots
    }

    /// All live element ids in ascending order.
    pub fn element_ids(&self) -> Vec<ElementId> {
        let mut ids: Vec<_> = self.elements.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Remove an element with its children, replacements and nodes.
    ///
    /// Essential values stay in the essential store. Returns the removed ids.
    pub fn remove_subtree(&mut self, root: ElementId) -> Vec<ElementId> {
        let mut removed = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(element) = self.elements.remove(&id) else {
                continue;
            };
            stack.extend(element.children.iter().copied());
            if let Some(state) = &element.composite {
                stack.extend(state.replacements.values().map(|r| r.root));
            }
            for node_id in element.variables.values() {
                self.remove_node(*node_id);
            }
            if let Some(scope) = self.scopes.get_mut(&element.scope) {
                scope.unbind_element(id);
            }
            // Template item hosts own the scope their names live in.
            if element.item_key.is_some() {
                self.remove_scope(element.scope);
            }
            removed.push(id);
        }
        self.roots.retain(|r| *r != root);
        self.epoch += 1;
        removed
    }

    // ── Scopes ──────────────────────────────────────────────────────

    pub fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = self.next_scope.unwrap_or(ScopeId::ROOT.next());
        self.next_scope = Some(id.next());
        self.scopes.insert(id, Scope::child_of(parent));
        id
    }

    pub fn remove_scope(&mut self, id: ScopeId) {
        if id != ScopeId::ROOT {
            self.scopes.remove(&id);
        }
    }

    pub fn bind_name(&mut self, scope: ScopeId, name: &str, binding: Binding) {
        if let Some(scope) = self.scopes.get_mut(&scope) {
            scope.bind(name, binding);
            self.epoch += 1;
        }
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    // ── Nodes ───────────────────────────────────────────────────────

    pub fn next_node_id(&mut self) -> NodeId {
        let id = NodeId::from(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn insert_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.changes.entry(node.key().clone()).or_insert(None);
        self.index.insert(node.key().clone(), id);
        self.nodes.insert(id, node);
        id
    }

    /// Drop a node and log its last value as a removal.
    ///
    /// Also removes it from the dependents lists of its producers. Its own
    /// dependents keep a dangling edge until the next resolution pass, which
    /// the structural epoch guarantees will happen.
    pub fn remove_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.remove(&node_id) {
            for producer in node.producers().collect::<Vec<_>>() {
                if let Some(producer) = self.nodes.get_mut(&producer) {
                    producer.remove_dependent(node_id);
                }
            }
            for dependent in node.dependents() {
                if let Some(dependent) = self.nodes.get_mut(dependent) {
                    dependent.mark_stale();
                }
            }
            if self.index.get(node.key()) == Some(&node_id) {
                self.index.remove(node.key());
            }
            let key = node.key().clone();
            let value = node.value().clone();
            self.changes.entry(key).or_insert(Some(value));
            self.epoch += 1;
        }
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn node_id(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn node_by_key(&self, key: &NodeKey) -> Option<&Node> {
        self.node_id(key).and_then(|id| self.nodes.get(&id))
    }

    /// All live node ids in ascending (creation) order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Live nodes, across every element.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Set a node's value, logging the previous value. Returns whether the
    /// value changed structurally.
    pub fn set_value(&mut self, node_id: NodeId, value: Value) -> bool {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        if node.value() == &value {
            return false;
        }
        let key = node.key().clone();
        let previous = node.replace_value(value);
        self.changes.entry(key).or_insert(Some(previous));
        true
    }

    /// Set an essential node and record the value in the essential store.
    pub fn assign_essential(&mut self, node_id: NodeId, value: Value) -> bool {
        let Some(node) = self.nodes.get(&node_id).filter(|n| n.is_essential()) else {
            return false;
        };
        if let Some(key) = self.essential_key(node.key()) {
            self.essentials.insert(key, value.clone());
        }
        self.set_value(node_id, value)
    }

    /// Put an essential node and its store entry back the way they were.
    /// `stored: None` means the store had no entry for the node.
    pub(crate) fn revert_essential(&mut self, node_id: NodeId, value: Value, stored: Option<Value>) {
        let Some(node) = self.nodes.get(&node_id).filter(|n| n.is_essential()) else {
            return;
        };
        if let Some(key) = self.essential_key(node.key()) {
            match stored {
                Some(stored) => {
                    self.essentials.insert(key, stored);
                }
                None => {
                    self.essentials.shift_remove(&key);
                }
            }
        }
        self.set_value(node_id, value);
    }

    /// Write an essential value by stable key. If the node is live its value
    /// is updated too; returns the node in that case.
    pub fn restore_essential(&mut self, key: &EssentialKey, value: Value) -> Option<NodeId> {
        self.essentials.insert(key.clone(), value.clone());
        let element = *self.ids.get(&key.path)?;
        let node_id = self.node_id(&NodeKey::new(element, key.variable.clone()))?;
        if !self.nodes.get(&node_id)?.is_essential() {
            return None;
        }
        self.set_value(node_id, value);
        Some(node_id)
    }

    /// Mark every node downstream of `changed` stale.
    ///
    /// Returns the nodes that were marked, in BFS order.
    pub fn mark_changed(&mut self, changed: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        let mut marked = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        for source in changed {
            if let Some(node) = self.nodes.get(&source) {
                queue.extend(node.dependents().iter().copied());
            }
        }

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.mark_stale();
                marked.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }
        marked
    }

    /// Extend the stale set to its downstream closure.
    pub fn propagate_staleness(&mut self) {
        let stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.validity() == Validity::Stale)
            .map(Node::id)
            .collect();
        self.mark_changed(stale);
    }

    /// Mark a node errored, logging the value it loses.
    pub fn mark_error(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            let key = node.key().clone();
            let previous = node.mark_error();
            self.changes.entry(key).or_insert(Some(previous));
        }
    }

    /// Replace a node's edges, keeping the dependents index in sync.
    /// Returns whether the edges changed.
    pub fn rewire(&mut self, node_id: NodeId, edges: smallvec::SmallVec<[ResolvedEdge; 2]>) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return false;
        };
        if node.edges() == edges.as_slice() {
            return false;
        }
        let old: Vec<NodeId> = node.producers().collect();
        let new: Vec<NodeId> = edges.iter().flat_map(ResolvedEdge::producers).collect();
        for producer in old {
            if let Some(producer) = self.nodes.get_mut(&producer) {
                producer.remove_dependent(node_id);
            }
        }
        for producer in new {
            if let Some(producer) = self.nodes.get_mut(&producer) {
                producer.add_dependent(node_id);
            }
        }
        self.nodes
            .get_mut(&node_id)
            .map(|node| node.set_edges(edges))
            .unwrap_or(false)
    }

    // ── Structure epoch ─────────────────────────────────────────────

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn needs_resolution(&self) -> bool {
        self.resolved_epoch != Some(self.epoch)
    }

    pub(crate) fn mark_resolved(&mut self) {
        self.resolved_epoch = Some(self.epoch);
    }

    /// Record a structural change that adds or removes no element, such as
    /// a reordered replacement set.
    pub fn touch_structure(&mut self) {
        self.epoch += 1;
    }

    /// Look a name up through `scope` and its ancestors. The innermost scope
    /// binding the name wins.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Lookup {
        let mut current = Some(scope);
        while let Some(id) = current {
            let Some(scope) = self.scopes.get(&id) else {
                break;
            };
            if let Some(bindings) = scope.names.get(name) {
                return match bindings.as_slice() {
                    [binding] => Lookup::Found(binding.clone()),
                    [] => Lookup::Missing,
                    _ => Lookup::Ambiguous,
                };
            }
            current = scope.parent;
        }
        Lookup::Missing
    }

    /// The element currently instantiated at a stable path.
    pub fn element_at(&self, path: &str) -> Option<ElementId> {
        self.ids
            .get(path)
            .copied()
            .filter(|id| self.elements.contains_key(id))
    }

    // ── Essential store and externals ───────────────────────────────

    pub fn essential(&self, key: &EssentialKey) -> Option<&Value> {
        self.essentials.get(key)
    }

    pub fn store_essential(&mut self, key: EssentialKey, value: Value) {
        self.essentials.insert(key, value);
    }

    pub fn essentials(&self) -> &IndexMap<EssentialKey, Value> {
        &self.essentials
    }

    pub(crate) fn replace_essentials(&mut self, essentials: IndexMap<EssentialKey, Value>) {
        self.essentials = essentials;
    }

    /// Essential-store key for a node, from its element's stable path.
    pub fn essential_key(&self, key: &NodeKey) -> Option<EssentialKey> {
        self.elements
            .get(&key.element)
            .map(|e| EssentialKey::new(e.path.clone(), key.variable.clone()))
    }

    pub fn external(&self, name: &str) -> Option<&Value> {
        self.externals.get(name)
    }

    pub fn externals(&self) -> &IndexMap<String, Value> {
        &self.externals
    }

    /// Set an external value. Returns the nodes reading it.
    pub fn set_external(&mut self, name: &str, value: Value) -> Vec<NodeId> {
        self.externals.insert(name.to_string(), value);
        self.node_ids()
            .into_iter()
            .filter(|id| {
                self.nodes[id].edges().iter().any(|edge| {
                    edge.targets()
                        .iter()
                        .any(|t| matches!(t, EdgeTarget::External(n) if n == name))
                })
            })
            .collect()
    }

    // ── Dependency values ───────────────────────────────────────────

    /// The value a node currently sees through one of its edges.
    pub fn dep_value(&self, reader: NodeId, edge: &ResolvedEdge) -> DepValue {
        match edge {
            ResolvedEdge::Absent => DepValue::Absent,
            ResolvedEdge::One(target) => self
                .member_value(reader, target)
                .map(DepValue::One)
                .unwrap_or(DepValue::Absent),
            ResolvedEdge::Many(targets) => DepValue::Many(
                targets
                    .iter()
                    .map(|t| self.member_value(reader, t).unwrap_or_default())
                    .collect(),
            ),
        }
    }

    fn member_value(&self, reader: NodeId, target: &EdgeTarget) -> Option<Value> {
        match target {
            EdgeTarget::Node(id) => self.live_value(*id).cloned(),
            EdgeTarget::Entry(id, index) => self
                .live_value(*id)
                .and_then(Value::as_list)
                .and_then(|items| items.get(*index))
                .cloned(),
            EdgeTarget::Item { node, key, field } => {
                let items = LogicalItem::decode(self.live_value(*node)?);
                let position = items.iter().position(|item| &item.key == key)?;
                Some(match field {
                    ItemField::Value => items[position].payload.clone(),
                    ItemField::Index => Value::Number((position + 1) as f64),
                })
            }
            EdgeTarget::Constant(value) => Some(value.clone()),
            EdgeTarget::Element(id) => Some(Value::Element(*id)),
            EdgeTarget::External(name) => self.externals.get(name).cloned(),
            EdgeTarget::Previous => self.nodes.get(&reader).map(|n| n.value().clone()),
        }
    }

    /// A node's value unless it is missing or errored.
    fn live_value(&self, id: NodeId) -> Option<&Value> {
        self.nodes
            .get(&id)
            .filter(|n| n.validity() != Validity::Error)
            .map(Node::value)
    }

    /// Whether the solver may push values through each member of an edge.
    pub fn edge_modifiability(&self, edge: &ResolvedEdge) -> smallvec::SmallVec<[bool; 2]> {
        let members = edge.targets();
        if members.is_empty() {
            return smallvec::smallvec![false];
        }
        members
            .iter()
            .map(|target| match target {
                EdgeTarget::Node(id) | EdgeTarget::Entry(id, _) => {
                    self.nodes.get(id).is_some_and(Node::is_modifiable)
                }
                _ => false,
            })
            .collect()
    }

    // ── Change log ──────────────────────────────────────────────────

    /// Drain the change log, comparing logged values with current ones.
    pub fn take_changes(&mut self) -> ChangeSet {
        let mut set = ChangeSet::default();
        let mut entries: Vec<_> = std::mem::take(&mut self.changes).into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, before) in entries {
            let now = self
                .node_by_key(&key)
                .filter(|n| n.validity() != Validity::Stale)
                .map(|n| n.value().clone());
            match (before, now) {
                (None, Some(now)) => {
                    set.changed.insert(key, now);
                }
                (Some(before), Some(now)) if before != now => {
                    set.changed.insert(key, now);
                }
                (Some(_), None) if self.node_id(&key).is_none() => set.removed.push(key),
                _ => {}
            }
        }
        set
    }

    /// Discard the change log without reporting it.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }
}
