//! Dependency Specifications and Resolved Edges
//!
//! A state variable declares *what* it depends on with a [`Dependency`].
//! The resolver turns each declaration into a [`ResolvedEdge`] that names
//! concrete producers. Declarations are the source of truth: edges are
//! recomputed from them on every resolution pass, so an edge never keeps a
//! pointer to a node that was torn down or renamed.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::element::ElementId;
use super::node::NodeId;
use crate::value::Value;

/// Which element a dependency starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// The element owning the dependent variable.
    This,
    Parent,
    /// A name looked up through the enclosing scopes.
    Name(String),
    /// The nearest proper ancestor whose type has the capability.
    Ancestor(String),
    Element(ElementId),
    /// The element referenced by one of this element's attributes.
    Attribute(String),
}

/// Filters the elements returned by subtree queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    Any,
    Capability(String),
    /// The capability named by a literal text attribute of the querying
    /// element (e.g. `collect componentType="point"`).
    CapabilityFromAttribute(String),
}

/// Which field of a hosting replacement item to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemField {
    /// The payload the composite enumerated for this item.
    Value,
    /// The item's 1-based position in the replacement set.
    Index,
}

/// A declared dependency of a state variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dependency {
    /// A state variable of another element. `None` selects the target
    /// type's primary variable.
    StateVar {
        target: Target,
        variable: Option<String>,
    },
    /// One member of an array-valued state variable.
    Entry {
        target: Target,
        variable: Option<String>,
        index: usize,
    },
    /// The owning element's attribute: literal, reference or list.
    Attribute(String),
    /// The target element itself, as a [`Value::Element`].
    Element(Target),
    /// Every descendant of `of` matching the selector. Composites are
    /// traversed through their replacements. With `variable: None` the
    /// matching elements themselves are the members.
    Descendants {
        of: Target,
        selector: Selector,
        variable: Option<String>,
    },
    /// Direct children of the owning element matching the selector.
    Children {
        selector: Selector,
        variable: Option<String>,
    },
    /// The replacement roots of a composite; absent for non-composites.
    Replacements(Target),
    /// A value injected from outside the graph.
    External(String),
    /// A field of the replacement item hosting the owning element.
    Item(ItemField),
    /// The node's own previous value. Only meaningful for convergent nodes.
    Previous,
}

impl Dependency {
    pub fn var(target: Target, variable: &str) -> Self {
        Dependency::StateVar {
            target,
            variable: Some(variable.to_string()),
        }
    }

    /// Another variable of the same element.
    pub fn own(variable: &str) -> Self {
        Self::var(Target::This, variable)
    }

    pub fn attribute(name: &str) -> Self {
        Dependency::Attribute(name.to_string())
    }
}

/// A concrete producer of a dependency value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeTarget {
    Node(NodeId),
    Entry(NodeId, usize),
    /// The items node of a composite, read at one item key.
    Item {
        node: NodeId,
        key: String,
        field: ItemField,
    },
    Constant(Value),
    Element(ElementId),
    External(String),
    Previous,
}

impl EdgeTarget {
    /// The graph node this target reads, if any.
    pub fn producer(&self) -> Option<NodeId> {
        match self {
            EdgeTarget::Node(id) | EdgeTarget::Entry(id, _) => Some(*id),
            EdgeTarget::Item { node, .. } => Some(*node),
            _ => None,
        }
    }
}

/// The result of resolving one dependency.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ResolvedEdge {
    #[default]
    Absent,
    One(EdgeTarget),
    Many(SmallVec<[EdgeTarget; 2]>),
}

impl ResolvedEdge {
    pub fn targets(&self) -> &[EdgeTarget] {
        match self {
            ResolvedEdge::Absent => &[],
            ResolvedEdge::One(t) => std::slice::from_ref(t),
            ResolvedEdge::Many(ts) => ts,
        }
    }

    pub fn producers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.targets().iter().filter_map(EdgeTarget::producer)
    }
}
