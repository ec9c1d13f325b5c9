//! Dependency Resolver
//!
//! Turns declared [`Dependency`] specifications into [`ResolvedEdge`]s.
//!
//! Resolution reads the graph's structure (elements, scopes, replacement
//! sets) but never node values, so a pass is idempotent: resolving twice
//! without a structural change in between yields identical edges. Anything
//! that does not resolve becomes [`ResolvedEdge::Absent`].

use smallvec::SmallVec;
use tracing::trace;

use super::dependency::{Dependency, EdgeTarget, ResolvedEdge, Selector, Target};
use super::element::ElementId;
use super::node::NodeId;
use super::{Graph, Lookup};
use crate::document::Attribute;
use crate::error::Diagnostic;
use crate::value::Value;

/// Outcome of one resolution pass over the whole graph.
#[derive(Debug, Default)]
pub struct ResolutionReport {
    /// Nodes whose edges changed.
    pub rewired: Vec<NodeId>,
    pub diagnostics: Vec<Diagnostic>,
    /// Composites found reading their own replacement set.
    pub self_referencing: Vec<ElementId>,
}

/// Per-node resolution context.
struct Resolution<'g> {
    graph: &'g Graph,
    reader: ElementId,
    diagnostics: Vec<Diagnostic>,
    self_reference: bool,
}

impl Graph {
    /// Re-resolve the edges of every derived node.
    ///
    /// Nodes whose edges changed are marked stale together with their
    /// downstream closure.
    pub fn resolve_all(&mut self) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        for node_id in self.node_ids() {
            let Some((element, edges, diagnostics, self_reference)) = self.resolve_node(node_id)
            else {
                continue;
            };
            for diagnostic in diagnostics {
                if !report.diagnostics.contains(&diagnostic) {
                    report.diagnostics.push(diagnostic);
                }
            }
            if self_reference && !report.self_referencing.contains(&element) {
                report.self_referencing.push(element);
            }
            if self.rewire(node_id, edges) {
                report.rewired.push(node_id);
            }
        }
        self.mark_changed(report.rewired.iter().copied());
        self.mark_resolved();
        report
    }

    #[allow(clippy::type_complexity)]
    fn resolve_node(
        &self,
        node_id: NodeId,
    ) -> Option<(ElementId, SmallVec<[ResolvedEdge; 2]>, Vec<Diagnostic>, bool)> {
        let node = self.node(node_id)?;
        let derivation = node.derivation()?;
        let mut resolution = Resolution {
            graph: self,
            reader: node.key().element,
            diagnostics: Vec::new(),
            self_reference: false,
        };
        let edges = derivation
            .dependencies
            .iter()
            .map(|(name, dependency)| {
                let edge = resolution.dependency(dependency);
                if edge == ResolvedEdge::Absent {
                    trace!(node = %node.key(), dependency = %name, "dependency resolved to absent");
                }
                edge
            })
            .collect();
        Some((
            resolution.reader,
            edges,
            resolution.diagnostics,
            resolution.self_reference,
        ))
    }

    /// The node holding `variable` of an element. `None` selects the type's
    /// primary variable. A composite lacking the variable forwards to its
    /// single replacement root.
    pub fn variable_node(&self, element: ElementId, variable: Option<&str>) -> Option<NodeId> {
        let mut current = element;
        // A forwarding chain can be no longer than the composite nesting.
        for _ in 0..=self.elements.len() {
            let el = self.element(current)?;
            let name = variable.or(el.element_type.primary.as_deref());
            if let Some(id) = name.and_then(|n| el.variables.get(n)) {
                return Some(*id);
            }
            let state = el.composite.as_ref()?;
            if state.replacements.len() != 1 {
                return None;
            }
            current = state.replacements.values().next()?.root;
        }
        None
    }

    /// Rendered descendants of `root` in pre-order, not including `root`.
    /// Subtrees of `skip` are not entered.
    pub fn rendered_descendants(&self, root: ElementId, skip: Option<ElementId>) -> Vec<ElementId> {
        let mut found = Vec::new();
        let mut stack: Vec<ElementId> = self
            .element(root)
            .map(|e| e.rendered_children().into_iter().rev().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            let Some(element) = self.element(id) else {
                continue;
            };
            found.push(id);
            if Some(id) != skip {
                stack.extend(element.rendered_children().into_iter().rev());
            }
        }
        found
    }

    /// Resolve a name as seen from an element.
    pub fn resolve_name(&self, from: ElementId, name: &str) -> Option<ElementId> {
        let scope = self.element(from)?.scope;
        match self.lookup(scope, name) {
            Lookup::Found(binding) => Some(binding.element),
            _ => None,
        }
    }
}

/// Whether `path` equals `ancestor` or lies below it.
fn within(ancestor: &str, path: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('['),
        None => false,
    }
}

impl Resolution<'_> {
    fn dependency(&mut self, dependency: &Dependency) -> ResolvedEdge {
        match dependency {
            Dependency::StateVar { target, variable } => {
                match self.state_var(target, variable.as_deref()) {
                    Some(node) => ResolvedEdge::One(EdgeTarget::Node(node)),
                    None => ResolvedEdge::Absent,
                }
            }
            Dependency::Entry {
                target,
                variable,
                index,
            } => match self.state_var(target, variable.as_deref()) {
                Some(node) => ResolvedEdge::One(EdgeTarget::Entry(node, *index)),
                None => ResolvedEdge::Absent,
            },
            Dependency::Attribute(name) => self.attribute(name),
            Dependency::Element(target) => match self.target(target) {
                Some((element, _)) => {
                    self.check_self_reference(&[element]);
                    ResolvedEdge::One(EdgeTarget::Element(element))
                }
                None => ResolvedEdge::Absent,
            },
            Dependency::Descendants {
                of,
                selector,
                variable,
            } => {
                let Some((root, _)) = self.target(of) else {
                    return ResolvedEdge::Absent;
                };
                let matches: Vec<ElementId> = self
                    .graph
                    .rendered_descendants(root, Some(self.reader))
                    .into_iter()
                    .filter(|id| self.selects(selector, *id))
                    .collect();
                self.check_self_reference(&matches);
                self.members(&matches, variable.as_deref())
            }
            Dependency::Children { selector, variable } => {
                let matches: Vec<ElementId> = self
                    .graph
                    .element(self.reader)
                    .map(|e| e.rendered_children())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|id| self.selects(selector, *id))
                    .collect();
                self.members(&matches, variable.as_deref())
            }
            Dependency::Replacements(target) => {
                let Some((element, _)) = self.target(target) else {
                    return ResolvedEdge::Absent;
                };
                let graph = self.graph;
                let Some(state) = graph.element(element).and_then(|e| e.composite.as_ref())
                else {
                    return ResolvedEdge::Absent;
                };
                let roots: Vec<ElementId> = state.replacements.values().map(|r| r.root).collect();
                self.check_self_reference(&roots);
                self.check_self_reference(&[element]);
                ResolvedEdge::Many(roots.into_iter().map(EdgeTarget::Element).collect())
            }
            Dependency::External(name) => ResolvedEdge::One(EdgeTarget::External(name.clone())),
            Dependency::Item(field) => {
                let mut current = self.graph.element(self.reader);
                while let Some(element) = current {
                    if let Some(key) = &element.item_key {
                        let node = element
                            .parent
                            .and_then(|p| self.graph.element(p))
                            .and_then(|p| p.composite.as_ref())
                            .and_then(|state| state.items_node);
                        return match node {
                            Some(node) => ResolvedEdge::One(EdgeTarget::Item {
                                node,
                                key: key.clone(),
                                field: *field,
                            }),
                            None => ResolvedEdge::Absent,
                        };
                    }
                    current = element.parent.and_then(|p| self.graph.element(p));
                }
                ResolvedEdge::Absent
            }
            Dependency::Previous => ResolvedEdge::One(EdgeTarget::Previous),
        }
    }

    fn state_var(&mut self, target: &Target, variable: Option<&str>) -> Option<NodeId> {
        let (element, bound) = self.target(target)?;
        self.graph
            .variable_node(element, variable.or(bound.as_deref()))
    }

    /// Resolve a target to an element and the variable it implies, if any.
    fn target(&mut self, target: &Target) -> Option<(ElementId, Option<String>)> {
        let graph = self.graph;
        let reader = graph.element(self.reader)?;
        match target {
            Target::This => Some((self.reader, None)),
            Target::Parent => reader.parent.map(|p| (p, None)),
            Target::Name(name) => self.lookup(reader.scope, name),
            Target::Ancestor(capability) => {
                let mut current = reader.parent;
                while let Some(id) = current {
                    let element = graph.element(id)?;
                    if element.element_type.has_capability(capability) {
                        return Some((id, None));
                    }
                    current = element.parent;
                }
                None
            }
            Target::Element(id) => graph.contains_element(*id).then_some((*id, None)),
            Target::Attribute(name) => {
                let bound = reader.attributes.get(name)?.clone();
                match bound.attribute {
                    Attribute::Ref { name, variable } => self
                        .lookup(bound.scope, &name)
                        .map(|(element, implied)| (element, variable.or(implied))),
                    Attribute::Element(id) | Attribute::Literal(Value::Element(id)) => {
                        graph.contains_element(id).then_some((id, None))
                    }
                    _ => None,
                }
            }
        }
    }

    fn lookup(&mut self, scope: super::ScopeId, name: &str) -> Option<(ElementId, Option<String>)> {
        match self.graph.lookup(scope, name) {
            Lookup::Found(binding) => Some((binding.element, binding.variable)),
            Lookup::Ambiguous => {
                self.diagnostics.push(Diagnostic::AmbiguousName {
                    name: name.to_string(),
                    from: self.reader,
                });
                None
            }
            Lookup::Missing => None,
        }
    }

    fn attribute(&mut self, name: &str) -> ResolvedEdge {
        let Some(bound) = self
            .graph
            .element(self.reader)
            .and_then(|e| e.attributes.get(name))
            .cloned()
        else {
            return ResolvedEdge::Absent;
        };
        match &bound.attribute {
            Attribute::List(items) => ResolvedEdge::Many(
                items
                    .iter()
                    .map(|item| {
                        self.attribute_target(item, bound.scope)
                            .unwrap_or(EdgeTarget::Constant(Value::Undefined))
                    })
                    .collect(),
            ),
            single => match self.attribute_target(single, bound.scope) {
                Some(target) => ResolvedEdge::One(target),
                None => ResolvedEdge::Absent,
            },
        }
    }

    fn attribute_target(&mut self, attribute: &Attribute, scope: super::ScopeId) -> Option<EdgeTarget> {
        match attribute {
            Attribute::Literal(value) => Some(EdgeTarget::Constant(value.clone())),
            Attribute::Ref { name, variable } => {
                let (element, implied) = self.lookup(scope, name)?;
                self.graph
                    .variable_node(element, variable.as_deref().or(implied.as_deref()))
                    .map(EdgeTarget::Node)
            }
            Attribute::Element(id) => self
                .graph
                .contains_element(*id)
                .then_some(EdgeTarget::Element(*id)),
            Attribute::List(items) => Some(EdgeTarget::Constant(Value::List(
                items
                    .iter()
                    .filter_map(Attribute::as_literal)
                    .cloned()
                    .collect(),
            ))),
        }
    }

    fn selects(&self, selector: &Selector, element: ElementId) -> bool {
        let Some(element) = self.graph.element(element) else {
            return false;
        };
        match selector {
            Selector::Any => true,
            Selector::Capability(capability) => element.element_type.has_capability(capability),
            Selector::CapabilityFromAttribute(attribute) => {
                let capability = self
                    .graph
                    .element(self.reader)
                    .and_then(|r| r.attributes.get(attribute))
                    .and_then(|bound| bound.attribute.as_literal())
                    .and_then(Value::as_text)
                    .map(str::to_string);
                match capability {
                    Some(capability) => element.element_type.has_capability(&capability),
                    None => true,
                }
            }
        }
    }

    fn members(&self, elements: &[ElementId], variable: Option<&str>) -> ResolvedEdge {
        ResolvedEdge::Many(
            elements
                .iter()
                .map(|id| match variable {
                    None => EdgeTarget::Element(*id),
                    Some(variable) => self
                        .graph
                        .variable_node(*id, Some(variable))
                        .map(EdgeTarget::Node)
                        .unwrap_or(EdgeTarget::Constant(Value::Undefined)),
                })
                .collect(),
        )
    }

    /// Flag a composite that reads an element enclosing it, or an element
    /// inside its own replacement set.
    fn check_self_reference(&mut self, elements: &[ElementId]) {
        let graph = self.graph;
        let Some(reader) = graph.element(self.reader) else {
            return;
        };
        if !reader.is_composite() {
            return;
        }
        let hit = elements.iter().filter_map(|id| graph.element(*id)).any(|element| {
            within(&element.path, &reader.path) || reader.owns_path(&element.path)
        });
        if hit {
            self.self_reference = true;
        }
    }
}
