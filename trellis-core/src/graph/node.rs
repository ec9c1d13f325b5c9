//! State-Variable Nodes
//!
//! One [`Node`] per state variable of an instantiated element: its value,
//! validity, definition and resolved edges.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::dependency::ResolvedEdge;
use super::element::ElementId;
use crate::registry::Derivation;
use crate::value::{DepValue, Value};

/// Arena index of a node. Allocated per graph, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Arena index, in creation order.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Logical identity of a node: the owning element and the variable name.
///
/// Unlike [`NodeId`], a key survives teardown and recreation of the element
/// at the same logical position. Serializes as `"e3.x"` so change maps stay
/// valid JSON objects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeKey {
    pub element: ElementId,
    pub variable: String,
}

impl NodeKey {
    pub fn new(element: ElementId, variable: impl Into<String>) -> Self {
        Self {
            element,
            variable: variable.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.element, self.variable)
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for NodeKey {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        let (element, variable) = text
            .split_once('.')
            .ok_or_else(|| format!("node key '{text}' has no variable"))?;
        let raw: u32 = element
            .strip_prefix('e')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| format!("node key '{text}' has a malformed element id"))?;
        Ok(NodeKey::new(ElementId::from(raw), variable))
    }
}

/// Validity of a node's cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    /// The value is up-to-date.
    Fresh,

    /// An input might have changed. The evaluator compares the inputs with
    /// those of the last computation before deciding to recompute.
    Stale,

    /// The node is being evaluated. Reaching it again means a cycle.
    Computing,

    /// The node is part of a forward cycle; its value is `Undefined`.
    Error,
}

/// A state-variable node in the graph.
#[derive(Debug)]
pub struct Node {
    /// Arena slot; never reused within a graph.
    id: NodeId,

    key: NodeKey,

    value: Value,

    /// Value an essential node returns to on reset.
    initial: Value,

    validity: Validity,

    /// `None` for essential nodes.
    derivation: Option<Arc<Derivation>>,

    /// Copied from the owning element; fixed nodes refuse inversion.
    fixed: bool,

    allows_non_finite: bool,

    /// One resolved edge per declared dependency, in declaration order.
    edges: SmallVec<[ResolvedEdge; 2]>,

    /// Set when the edges changed since the last computation, forcing a
    /// recomputation even if the input values happen to match.
    edges_changed: bool,

    /// Nodes that read from this node.
    dependents: HashSet<NodeId>,

    /// Dependency values used by the last computation.
    last_inputs: Option<Vec<DepValue>>,
}

impl Node {
    /// Create an essential node holding `value`.
    pub fn essential(id: NodeId, key: NodeKey, value: Value, initial: Value) -> Self {
        Self {
            id,
            key,
            value,
            initial,
            validity: Validity::Fresh,
            derivation: None,
            fixed: false,
            allows_non_finite: false,
            edges: SmallVec::new(),
            edges_changed: false,
            dependents: HashSet::new(),
            last_inputs: None,
        }
    }

    /// Create a derived node. It starts stale to ensure first computation.
    pub fn derived(id: NodeId, key: NodeKey, derivation: Arc<Derivation>) -> Self {
        Self {
            id,
            key,
            value: Value::Undefined,
            initial: Value::Undefined,
            validity: Validity::Stale,
            derivation: Some(derivation),
            fixed: false,
            allows_non_finite: false,
            edges: SmallVec::new(),
            edges_changed: true,
            dependents: HashSet::new(),
            last_inputs: None,
        }
    }

    pub fn with_flags(mut self, fixed: bool, allows_non_finite: bool) -> Self {
        self.fixed = fixed;
        self.allows_non_finite = allows_non_finite;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn initial(&self) -> &Value {
        &self.initial
    }

    /// Replace the value, returning the previous one.
    pub(crate) fn replace_value(&mut self, value: Value) -> Value {
        std::mem::replace(&mut self.value, value)
    }

    pub fn is_essential(&self) -> bool {
        self.derivation.is_none()
    }

    pub fn derivation(&self) -> Option<&Arc<Derivation>> {
        self.derivation.as_ref()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn allows_non_finite(&self) -> bool {
        self.allows_non_finite
    }

    /// Whether the inverse solver may push a value into this node.
    pub fn is_modifiable(&self) -> bool {
        !self.fixed
            && self.validity != Validity::Error
            && self
                .derivation
                .as_ref()
                .map_or(true, |d| d.is_invertible())
    }

    /// Fresh, stale, being computed, or failed.
    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_fresh(&self) -> bool {
        self.validity == Validity::Fresh
    }

    /// Mark the node as fresh.
    pub fn mark_fresh(&mut self) {
        self.validity = Validity::Fresh;
        self.edges_changed = false;
    }

    /// Mark the node as stale. Essential nodes are always fresh.
    pub fn mark_stale(&mut self) {
        if !self.is_essential() && self.validity != Validity::Computing {
            self.validity = Validity::Stale;
        }
    }

    pub fn mark_computing(&mut self) {
        self.validity = Validity::Computing;
    }

    /// Mark the node as part of a cycle. Its value becomes `Undefined`.
    pub fn mark_error(&mut self) -> Value {
        self.validity = Validity::Error;
        self.last_inputs = None;
        std::mem::take(&mut self.value)
    }

    pub fn edges(&self) -> &[ResolvedEdge] {
        &self.edges
    }

    /// Install freshly resolved edges. Returns whether they differ from the
    /// previous ones; a change marks the node stale and forces recomputation.
    pub fn set_edges(&mut self, edges: SmallVec<[ResolvedEdge; 2]>) -> bool {
        if self.edges == edges {
            return false;
        }
        self.edges = edges;
        self.edges_changed = true;
        self.mark_stale();
        true
    }

    /// Whether the inputs must be recomputed regardless of their values.
    pub fn edges_changed(&self) -> bool {
        self.edges_changed
    }

    /// All nodes this node reads from.
    pub fn producers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().flat_map(ResolvedEdge::producers)
    }

    /// Record that `node_id` reads this variable, so marking this node
    /// changed reaches it.
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Forget a reader whose edges no longer point here.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.remove(&node_id);
    }

    /// Readers of this variable, in no particular order.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }

    pub fn last_inputs(&self) -> Option<&[DepValue]> {
        self.last_inputs.as_deref()
    }

    pub fn set_last_inputs(&mut self, inputs: Vec<DepValue>) {
        self.last_inputs = Some(inputs);
    }
}
