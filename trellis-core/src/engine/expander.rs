//! Composite Expander
//!
//! Instantiates element declarations into the graph and keeps every
//! composite's replacement set in step with its `items` node.
//!
//! # Identity
//!
//! Each element gets a stable path: `/1/0` for the first child of the second
//! top-level element, `/1[3]` for the replacement of item `3` of the
//! composite at `/1`. Element ids are minted from paths and essential values
//! are stored by path, so an item that vanishes and later reappears under
//! the same key comes back with the same id, the same node keys, and the
//! essential values it had.
//!
//! # Reconciliation
//!
//! A reconcile diffs the enumerated item keys against the current set:
//! vanished keys are torn down, new keys instantiated, persisting keys keep
//! their subtree and only update their payload.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::document::{Attribute, ElementDecl};
use crate::error::{Diagnostic, EngineError};
use crate::graph::{
    Binding, BoundAttribute, CompositeState, Dependency, Element, ElementId, EssentialKey, Graph,
    Node, NodeId, NodeKey, ReplacementItem, ScopeId, Target, Validity,
};
use crate::registry::{
    Derivation, ExpansionMode, LogicalItem, Registry, StateVarKind, ITEM_TYPE,
};
use crate::value::Value;

/// Where a new element goes.
#[derive(Debug, Clone)]
pub(crate) struct Site {
    pub parent: Option<ElementId>,
    pub scope: ScopeId,
    pub path: String,
    pub depth: usize,
    /// Set for template item hosts.
    pub item_key: Option<String>,
    /// Replacement roots are not listed among their composite's children.
    pub replacement: bool,
}

impl Site {
    pub fn top_level(index: usize) -> Self {
        Self {
            parent: None,
            scope: ScopeId::ROOT,
            path: format!("/{index}"),
            depth: 0,
            item_key: None,
            replacement: false,
        }
    }

    fn child(&self, parent: ElementId, index: usize) -> Self {
        Self {
            parent: Some(parent),
            scope: self.scope,
            path: format!("{}/{index}", self.path),
            depth: self.depth,
            item_key: None,
            replacement: false,
        }
    }
}

fn literal_flag(attribute: Option<&Attribute>) -> bool {
    attribute
        .and_then(Attribute::as_literal)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub(crate) struct Expander<'a> {
    graph: &'a mut Graph,
    registry: &'a Registry,
    config: &'a EngineConfig,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl<'a> Expander<'a> {
    pub(crate) fn new(
        graph: &'a mut Graph,
        registry: &'a Registry,
        config: &'a EngineConfig,
        diagnostics: &'a mut Vec<Diagnostic>,
    ) -> Self {
        Self {
            graph,
            registry,
            config,
            diagnostics,
        }
    }

    /// Instantiate a declaration and, unless it is a composite, its
    /// children. Composites are expanded later, once their `items` node has
    /// a value.
    pub(crate) fn instantiate(&mut self, decl: &ElementDecl, site: Site) -> Result<ElementId, EngineError> {
        let element_type = self
            .registry
            .get(&decl.element_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownElementType(decl.element_type.clone()))?;

        let id = self.graph.mint_element_id(&site.path);
        if self.graph.contains_element(id) {
            self.graph.remove_subtree(id);
        }

        let template = match &element_type.composite {
            Some(spec) if spec.mode == ExpansionMode::Template => decl.children.clone(),
            _ => Vec::new(),
        };
        let element = Element {
            id,
            element_type: Arc::clone(&element_type),
            name: decl.name.clone(),
            parent: site.parent,
            scope: site.scope,
            path: site.path.clone(),
            children: Vec::new(),
            attributes: decl
                .attributes
                .iter()
                .map(|(name, attribute)| {
                    let bound = BoundAttribute {
                        attribute: attribute.clone(),
                        scope: site.scope,
                    };
                    (name.clone(), bound)
                })
                .collect(),
            fixed: literal_flag(decl.attributes.get("fixed")),
            link: None,
            item_key: site.item_key.clone(),
            template,
            composite: element_type.composite.as_ref().map(|_| CompositeState::default()),
            depth: site.depth,
            variables: IndexMap::new(),
        };
        self.graph.insert_element(element);
        self.attach(&site, id);
        if let Some(name) = &decl.name {
            self.graph.bind_name(
                site.scope,
                name,
                Binding {
                    element: id,
                    variable: None,
                },
            );
        }

        self.create_variables(id, None);
        if element_type.is_composite() {
            self.create_items_node(id);
            return Ok(id);
        }
        for (index, child) in decl.children.iter().enumerate() {
            self.instantiate(child, site.child(id, index))?;
        }
        Ok(id)
    }

    /// Instantiate a linked copy of `source`.
    ///
    /// Variables not overridden by an attribute pass through to the
    /// source's nodes, so editing the copy edits the source. Static children
    /// are copied the same way; nested composites are not.
    pub(crate) fn instantiate_link(
        &mut self,
        source: ElementId,
        site: Site,
        overrides: IndexMap<String, BoundAttribute>,
    ) -> Option<ElementId> {
        let src = self.graph.element(source)?;
        let element_type = Arc::clone(&src.element_type);
        let overridden: HashSet<String> = overrides.keys().cloned().collect();
        let fixed = src.fixed || literal_flag(overrides.get("fixed").map(|b| &b.attribute));
        let children = if src.is_composite() {
            Vec::new()
        } else {
            src.children.clone()
        };
        let mut attributes = src.attributes.clone();
        attributes.extend(overrides);

        let id = self.graph.mint_element_id(&site.path);
        if self.graph.contains_element(id) {
            self.graph.remove_subtree(id);
        }
        self.graph.insert_element(Element {
            id,
            element_type,
            name: None,
            parent: site.parent,
            scope: site.scope,
            path: site.path.clone(),
            children: Vec::new(),
            attributes,
            fixed,
            link: Some(source),
            item_key: None,
            template: Vec::new(),
            composite: None,
            depth: site.depth,
            variables: IndexMap::new(),
        });
        self.attach(&site, id);
        self.create_variables(id, Some((source, &overridden)));

        for (index, child) in children.into_iter().enumerate() {
            if self.graph.element(child).is_some_and(Element::is_composite) {
                continue;
            }
            self.instantiate_link(child, site.child(id, index), IndexMap::new());
        }
        Some(id)
    }

    fn attach(&mut self, site: &Site, id: ElementId) {
        if site.replacement {
            return;
        }
        if let Some(parent) = site.parent.and_then(|p| self.graph.element_mut(p)) {
            parent.children.push(id);
        }
    }

    /// Create one node per declared state variable, in declaration order.
    fn create_variables(&mut self, element_id: ElementId, link: Option<(ElementId, &HashSet<String>)>) {
        let Some(element) = self.graph.element(element_id) else {
            return;
        };
        let element_type = Arc::clone(&element.element_type);
        let attributes = element.attributes.clone();
        let path = element.path.clone();
        let fixed = element.fixed;

        for spec in &element_type.variables {
            let key = NodeKey::new(element_id, spec.name.clone());
            let id = self.graph.next_node_id();

            let linked = link.and_then(|(source, overridden)| {
                let follows_source = match &spec.kind {
                    StateVarKind::Essential { .. } => true,
                    StateVarKind::Attribute { attribute, .. } => !overridden.contains(attribute),
                    StateVarKind::Derived(derivation) => derivation
                        .dependencies
                        .iter()
                        .any(|(_, d)| matches!(d, Dependency::Item(_))),
                };
                let has_variable = self
                    .graph
                    .element(source)
                    .is_some_and(|s| s.variables.contains_key(&spec.name));
                (follows_source && has_variable).then_some(source)
            });

            let node = match (&spec.kind, linked) {
                (_, Some(source)) => {
                    let dependency = Dependency::var(Target::Element(source), &spec.name);
                    Node::derived(id, key, Arc::new(Derivation::pass_through(dependency)))
                }
                (StateVarKind::Essential { default }, None) => {
                    self.essential_node(id, key, &path, default)
                }
                (StateVarKind::Attribute { attribute, default }, None) => {
                    match attributes.get(attribute).map(|b| &b.attribute) {
                        Some(Attribute::Literal(seed)) => self.essential_node(id, key, &path, seed),
                        Some(_) => {
                            let dependency = Dependency::attribute(attribute);
                            Node::derived(id, key, Arc::new(Derivation::pass_through(dependency)))
                        }
                        None => self.essential_node(id, key, &path, default),
                    }
                }
                (StateVarKind::Derived(derivation), None) => {
                    Node::derived(id, key, Arc::clone(derivation))
                }
            };
            self.register_node(element_id, &spec.name, node.with_flags(fixed, spec.allows_non_finite));
        }
    }

    /// An essential node seeded from the essential store when the path has
    /// held a value before.
    fn essential_node(&self, id: NodeId, key: NodeKey, path: &str, initial: &Value) -> Node {
        let stored = self
            .graph
            .essential(&EssentialKey::new(path, key.variable.clone()))
            .cloned();
        let value = stored.unwrap_or_else(|| initial.clone());
        Node::essential(id, key, value, initial.clone())
    }

    fn register_node(&mut self, element_id: ElementId, variable: &str, node: Node) -> NodeId {
        let id = self.graph.insert_node(node);
        if let Some(element) = self.graph.element_mut(element_id) {
            element.variables.insert(variable.to_string(), id);
        }
        id
    }

    /// The derived node holding a composite's encoded item list.
    fn create_items_node(&mut self, element_id: ElementId) {
        let Some(spec) = self
            .graph
            .element(element_id)
            .and_then(|e| e.element_type.composite.clone())
        else {
            return;
        };
        let enumerate = Arc::clone(&spec.enumerate);
        // One past the limit so truncation can be detected.
        let limit = self.config.max_replacements.saturating_add(1);
        let derivation = spec.controlling.iter().fold(
            Derivation::new(move |deps| LogicalItem::encode(&enumerate(deps, limit))),
            |derivation, (name, dependency)| derivation.depends_on(name, dependency.clone()),
        );

        let id = self.graph.next_node_id();
        let node = Node::derived(id, NodeKey::new(element_id, "items"), Arc::new(derivation));
        let id = self.register_node(element_id, "items", node);
        if let Some(state) = self
            .graph
            .element_mut(element_id)
            .and_then(|e| e.composite.as_mut())
        {
            state.items_node = Some(id);
        }
    }

    /// Reconcile every composite. Returns the composites whose replacement
    /// set changed shape.
    pub(crate) fn expand_all(&mut self) -> Vec<ElementId> {
        let mut changed = Vec::new();
        for id in self.graph.element_ids() {
            if !self.graph.element(id).is_some_and(Element::is_composite) {
                continue;
            }
            match self.reconcile(id) {
                Ok(true) => changed.push(id),
                Ok(false) => {}
                Err(err) => {
                    self.halt(id, err.to_string());
                    changed.push(id);
                }
            }
        }
        changed
    }

    /// Diff a composite's replacement set against its current items.
    /// Returns whether the set changed shape.
    pub(crate) fn reconcile(&mut self, composite: ElementId) -> Result<bool, EngineError> {
        let Some(element) = self.graph.element(composite) else {
            return Ok(false);
        };
        let Some(state) = element.composite.as_ref() else {
            return Ok(false);
        };
        if state.halted {
            return Ok(false);
        }
        let Some(items_node) = state.items_node else {
            return Ok(false);
        };
        let value = self
            .graph
            .node(items_node)
            .filter(|n| n.validity() != Validity::Error)
            .map(|n| n.value().clone())
            .unwrap_or_default();
        if state.expanded.as_ref() == Some(&value) {
            return Ok(false);
        }
        let depth = element.depth;
        let previous = state.replacements.clone();

        let mut items = LogicalItem::decode(&value);
        if items.len() > self.config.max_replacements {
            items.truncate(self.config.max_replacements);
            self.report(
                composite,
                format!("more than {} replacement items", self.config.max_replacements),
            );
        }
        if !items.is_empty() && depth >= self.config.max_expansion_depth {
            self.halt(
                composite,
                format!("nesting depth exceeds {}", self.config.max_expansion_depth),
            );
            return Ok(true);
        }

        let wanted: HashSet<&str> = items.iter().map(|item| item.key.as_str()).collect();
        let mut removed = 0;
        for (key, item) in &previous {
            if !wanted.contains(key.as_str()) {
                self.graph.remove_subtree(item.root);
                removed += 1;
            }
        }

        let mut next: IndexMap<String, ReplacementItem> = IndexMap::new();
        let mut added = 0;
        for item in &items {
            if next.contains_key(&item.key) {
                continue;
            }
            let root = match previous.get(&item.key) {
                Some(existing) if self.graph.contains_element(existing.root) => Some(existing.root),
                _ => {
                    let root = self.create_item(composite, item)?;
                    added += usize::from(root.is_some());
                    root
                }
            };
            if let Some(root) = root {
                let replacement = ReplacementItem {
                    root,
                    payload: item.payload.clone(),
                };
                next.insert(item.key.clone(), replacement);
            }
        }

        let reordered = removed == 0 && added == 0 && !previous.keys().eq(next.keys());
        if reordered {
            self.graph.touch_structure();
        }
        if let Some(state) = self
            .graph
            .element_mut(composite)
            .and_then(|e| e.composite.as_mut())
        {
            state.replacements = next;
            state.expanded = Some(value);
        }
        debug!(%composite, added, removed, reordered, "reconciled replacement set");
        Ok(added > 0 || removed > 0 || reordered)
    }

    /// Instantiate the subtree for one new item.
    fn create_item(&mut self, composite: ElementId, item: &LogicalItem) -> Result<Option<ElementId>, EngineError> {
        let Some(element) = self.graph.element(composite) else {
            return Ok(None);
        };
        let Some(spec) = element.element_type.composite.clone() else {
            return Ok(None);
        };
        let path = format!("{}[{}]", element.path, item.key);
        let depth = element.depth + 1;
        let outer_scope = element.scope;

        match spec.mode {
            ExpansionMode::Template => {
                let names: Vec<(String, &str)> = [("valueName", "value"), ("indexName", "index")]
                    .into_iter()
                    .filter_map(|(attribute, variable)| {
                        let name = element.attributes.get(attribute)?.attribute.as_literal()?.as_text()?;
                        Some((name.to_string(), variable))
                    })
                    .collect();
                let mut host = ElementDecl::new(ITEM_TYPE);
                host.children = element.template.clone();

                let scope = self.graph.new_scope(outer_scope);
                let site = Site {
                    parent: Some(composite),
                    scope,
                    path,
                    depth,
                    item_key: Some(item.key.clone()),
                    replacement: true,
                };
                let root = self.instantiate(&host, site)?;
                for (name, variable) in names {
                    self.graph.bind_name(
                        scope,
                        &name,
                        Binding {
                            element: root,
                            variable: Some(variable.to_string()),
                        },
                    );
                }
                Ok(Some(root))
            }
            ExpansionMode::Link => {
                let Some(source) = item
                    .payload
                    .as_element()
                    .filter(|id| self.graph.contains_element(*id))
                else {
                    return Ok(None);
                };
                let overrides: IndexMap<String, BoundAttribute> = element
                    .attributes
                    .iter()
                    .filter(|(name, _)| !spec.own_attributes.contains(name))
                    .map(|(name, bound)| (name.clone(), bound.clone()))
                    .collect();
                let site = Site {
                    parent: Some(composite),
                    scope: outer_scope,
                    path,
                    depth,
                    item_key: None,
                    replacement: true,
                };
                Ok(self.instantiate_link(source, site, overrides))
            }
        }
    }

    /// Cut a composite off: tear its replacements down and keep it empty.
    pub(crate) fn halt(&mut self, composite: ElementId, reason: String) {
        let Some(state) = self
            .graph
            .element_mut(composite)
            .and_then(|e| e.composite.as_mut())
        else {
            return;
        };
        if state.halted {
            return;
        }
        let roots: Vec<ElementId> = state.replacements.drain(..).map(|(_, r)| r.root).collect();
        state.halted = true;
        state.expanded = None;
        for root in roots {
            self.graph.remove_subtree(root);
        }
        self.graph.touch_structure();
        self.report(composite, reason);
    }

    fn report(&mut self, composite: ElementId, reason: String) {
        warn!(%composite, %reason, "composite expansion cut off");
        self.diagnostics
            .push(Diagnostic::ExpansionNonTermination { composite, reason });
    }
}
