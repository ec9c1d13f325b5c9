//! Elements and Scopes
//!
//! Elements own state-variable nodes. Their ids are minted from a stable,
//! position-based path so that an element recreated at the same logical
//! position (for example the third item of a repeat) receives the same id,
//! and therefore the same node keys, as before it was torn down.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::node::NodeId;
use crate::document::{Attribute, ElementDecl};
use crate::registry::ElementType;
use crate::value::Value;

/// Identifier of an element, stable for a given logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(u32);

impl ElementId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ElementId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);

    pub(crate) fn next(self) -> ScopeId {
        ScopeId(self.0 + 1)
    }
}

/// What a name in a scope refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub element: ElementId,
    /// Set for names bound to one variable, such as a repeat's `valueName`.
    pub variable: Option<String>,
}

/// A naming scope. Replacement items each open a child scope.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub names: IndexMap<String, SmallVec<[Binding; 1]>>,
}

impl Scope {
    pub fn child_of(parent: ScopeId) -> Self {
        Self {
            parent: Some(parent),
            names: IndexMap::new(),
        }
    }

    pub fn bind(&mut self, name: &str, binding: Binding) {
        self.names.entry(name.to_string()).or_default().push(binding);
    }

    pub fn unbind_element(&mut self, element: ElementId) {
        for bindings in self.names.values_mut() {
            bindings.retain(|b| b.element != element);
        }
        self.names.retain(|_, bindings| !bindings.is_empty());
    }
}

/// An attribute together with the scope its references resolve in.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundAttribute {
    pub attribute: Attribute,
    pub scope: ScopeId,
}

/// One entry of a composite's replacement set.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementItem {
    pub root: ElementId,
    pub payload: Value,
}

/// Expansion state of a composite element.
#[derive(Debug, Clone, Default)]
pub struct CompositeState {
    /// The composite's own `items` node.
    pub items_node: Option<NodeId>,
    /// Current replacement set in enumeration order, keyed by stable key.
    pub replacements: IndexMap<String, ReplacementItem>,
    /// The encoded item list the current replacement set was built from.
    pub expanded: Option<Value>,
    /// Set once the composite has been cut off. A halted composite stays
    /// empty for the rest of its lifetime.
    pub halted: bool,
}

/// An instantiated element.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub element_type: Arc<ElementType>,
    pub name: Option<String>,
    pub parent: Option<ElementId>,
    /// The scope this element's name is bound in; children share it.
    pub scope: ScopeId,
    /// Position-based identity used to mint the id and key essential state.
    pub path: String,
    pub children: Vec<ElementId>,
    pub attributes: IndexMap<String, BoundAttribute>,
    pub fixed: bool,
    /// The element this one is a linked copy of.
    pub link: Option<ElementId>,
    /// For item hosts: the key of the item in the parent composite.
    pub item_key: Option<String>,
    /// Children declarations of a template-mode composite.
    pub template: Vec<ElementDecl>,
    pub composite: Option<CompositeState>,
    /// Number of composites between this element and the document.
    pub depth: usize,
    /// State variables in declaration order.
    pub variables: IndexMap<String, NodeId>,
}

impl Element {
    pub fn type_name(&self) -> &str {
        &self.element_type.name
    }

    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    /// Children as they appear in the rendered tree: a composite is replaced
    /// by its replacement roots.
    pub fn rendered_children(&self) -> Vec<ElementId> {
        match &self.composite {
            Some(state) => state.replacements.values().map(|r| r.root).collect(),
            None => self.children.clone(),
        }
    }

    /// Whether `path` lies inside this composite's replacement set.
    pub fn owns_path(&self, path: &str) -> bool {
        path.len() > self.path.len()
            && path.starts_with(&self.path)
            && path[self.path.len()..].starts_with('[')
    }
}
