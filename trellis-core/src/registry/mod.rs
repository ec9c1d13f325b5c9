//! Element-Type Registry
//!
//! The engine knows nothing about points, sums or inputs. Each element type
//! registers its state variables here, and the engine only ever calls the
//! definitions through this interface.
//!
//! # State variable kinds
//!
//! - **Essential**: a free degree of freedom with a default value. Only the
//!   inverse solver changes it.
//! - **Attribute**: bound to one attribute of the declaration. A literal
//!   attribute seeds an essential variable; a reference makes the variable a
//!   pass-through of the referenced node (invertible); no attribute falls
//!   back to an essential variable with the default.
//! - **Derived**: a [`Derivation`] with a forward definition and an optional
//!   inverse.
//!
//! Composite types additionally carry a [`CompositeSpec`] describing how to
//! enumerate their logical items.

mod deps;
pub mod standard;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::Refusal;
use crate::graph::Dependency;
use crate::value::{DepValue, Value};

pub use deps::{DepEntry, Deps};

/// Name of the host element type the engine creates for template items.
pub const ITEM_TYPE: &str = "item";

/// Forward definition: dependency values to node value.
pub type ForwardFn = Arc<dyn Fn(&Deps<'_>) -> Value + Send + Sync>;

/// Inverse definition: desired value and current dependency values to
/// desired dependency values.
pub type InverseFn = Arc<dyn Fn(&Value, &Deps<'_>) -> InverseResult + Send + Sync>;

/// Enumerates a composite's logical items, producing at most `limit` items.
pub type EnumerateFn = Arc<dyn Fn(&Deps<'_>, usize) -> Vec<LogicalItem> + Send + Sync>;

/// One desired dependency value proposed by an inverse definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Desired {
    pub dependency: String,
    /// Member index for multi-target dependencies.
    pub member: Option<usize>,
    pub value: Value,
}

/// The outcome of an inverse definition.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseResult {
    Refused(Refusal),
    /// Each entry is an independent branch; the solver applies the ones
    /// that succeed.
    Desired(SmallVec<[Desired; 2]>),
}

impl InverseResult {
    pub fn set(dependency: &str, value: Value) -> Self {
        InverseResult::Desired(SmallVec::new()).and(dependency, value)
    }

    pub fn set_member(dependency: &str, member: usize, value: Value) -> Self {
        InverseResult::Desired(SmallVec::new()).and_member(dependency, member, value)
    }

    /// Add another branch targeting one member. No-op on a refusal.
    pub fn and_member(mut self, dependency: &str, member: usize, value: Value) -> Self {
        if let InverseResult::Desired(ref mut desired) = self {
            desired.push(Desired {
                dependency: dependency.to_string(),
                member: Some(member),
                value,
            });
        }
        self
    }

    /// Add another branch. No-op on a refusal.
    pub fn and(mut self, dependency: &str, value: Value) -> Self {
        if let InverseResult::Desired(ref mut desired) = self {
            desired.push(Desired {
                dependency: dependency.to_string(),
                member: None,
                value,
            });
        }
        self
    }
}

/// The member of `name` an inverse definition may move.
///
/// Succeeds only when exactly one present member is modifiable. Two or more
/// modifiable members alias into one observable, so the dimension refuses
/// as [`Refusal::Ambiguous`]; none at all refuses as [`Refusal::Fixed`].
pub fn sole_modifiable(deps: &Deps<'_>, name: &str) -> Result<usize, Refusal> {
    let entry = deps.entry(name).ok_or(Refusal::Absent)?;
    if entry.value.is_absent() {
        return Err(Refusal::Absent);
    }
    let mut modifiable = entry
        .modifiable
        .iter()
        .enumerate()
        .filter(|(_, modifiable)| **modifiable)
        .map(|(member, _)| member);
    match (modifiable.next(), modifiable.next()) {
        (Some(member), None) => Ok(member),
        (Some(_), Some(_)) => Err(Refusal::Ambiguous),
        (None, _) => Err(Refusal::Fixed),
    }
}

/// A forward definition with its dependency declarations.
pub struct Derivation {
    pub dependencies: Vec<(String, Dependency)>,
    pub forward: ForwardFn,
    pub inverse: Option<InverseFn>,
    /// Whether the node iterates its definition to a fixed point, reading
    /// its own previous value through a [`Dependency::Previous`] edge.
    pub convergent: bool,
}

impl Derivation {
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(&Deps<'_>) -> Value + Send + Sync + 'static,
    {
        Self {
            dependencies: Vec::new(),
            forward: Arc::new(forward),
            inverse: None,
            convergent: false,
        }
    }

    /// Identity forward and inverse through a single dependency. A
    /// multi-target dependency reads as a list and inverts member-wise.
    pub fn pass_through(dependency: Dependency) -> Self {
        Self::new(|deps| match deps.get("source") {
            DepValue::One(v) => v.clone(),
            DepValue::Many(items) => Value::List(items.clone()),
            DepValue::Absent => Value::Undefined,
        })
        .depends_on("source", dependency)
        .invert_with(|desired, deps| match deps.get("source") {
            DepValue::Many(items) => match desired.as_list() {
                Some(wanted) if wanted.len() == items.len() => {
                    let mut result = InverseResult::Desired(SmallVec::new());
                    for (member, value) in wanted.iter().enumerate() {
                        result = result.and_member("source", member, value.clone());
                    }
                    result
                }
                _ => InverseResult::Refused(Refusal::Mismatch),
            },
            _ => InverseResult::set("source", desired.clone()),
        })
    }

    pub fn depends_on(mut self, name: &str, dependency: Dependency) -> Self {
        self.dependencies.push((name.to_string(), dependency));
        self
    }

    pub fn invert_with<F>(mut self, inverse: F) -> Self
    where
        F: Fn(&Value, &Deps<'_>) -> InverseResult + Send + Sync + 'static,
    {
        self.inverse = Some(Arc::new(inverse));
        self
    }

    pub fn convergent(mut self) -> Self {
        self.convergent = true;
        self
    }

    pub fn is_invertible(&self) -> bool {
        self.inverse.is_some()
    }
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivation")
            .field("dependencies", &self.dependencies)
            .field("invertible", &self.is_invertible())
            .field("convergent", &self.convergent)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StateVarKind {
    Essential { default: Value },
    Attribute { attribute: String, default: Value },
    Derived(Arc<Derivation>),
}

/// Declaration of one state variable of an element type.
#[derive(Debug, Clone)]
pub struct StateVarSpec {
    pub name: String,
    pub kind: StateVarKind,
    /// Whether inversion may push NaN/infinite values into this variable.
    pub allows_non_finite: bool,
}

impl StateVarSpec {
    pub fn essential(name: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: StateVarKind::Essential { default },
            allows_non_finite: false,
        }
    }

    pub fn attribute(name: &str, attribute: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: StateVarKind::Attribute {
                attribute: attribute.to_string(),
                default,
            },
            allows_non_finite: false,
        }
    }

    pub fn derived(name: &str, derivation: Derivation) -> Self {
        Self {
            name: name.to_string(),
            kind: StateVarKind::Derived(Arc::new(derivation)),
            allows_non_finite: false,
        }
    }

    pub fn allow_non_finite(mut self) -> Self {
        self.allows_non_finite = true;
        self
    }

    /// The attribute this variable binds to, if any.
    pub fn bound_attribute(&self) -> Option<&str> {
        match &self.kind {
            StateVarKind::Attribute { attribute, .. } => Some(attribute),
            _ => None,
        }
    }
}

/// How a composite turns logical items into replacement subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionMode {
    /// Instantiate the composite's own children under an item host whose
    /// `value`/`index` variables expose the item.
    Template,
    /// The payload is a [`Value::Element`]; instantiate a linked copy of it.
    Link,
}

/// One item enumerated by a composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalItem {
    /// Stable identity of the item across re-expansions.
    pub key: String,
    pub payload: Value,
}

impl LogicalItem {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    pub(crate) fn encode(items: &[LogicalItem]) -> Value {
        Value::List(
            items
                .iter()
                .map(|item| Value::List(vec![Value::Text(item.key.clone()), item.payload.clone()]))
                .collect(),
        )
    }

    pub(crate) fn decode(value: &Value) -> Vec<LogicalItem> {
        value
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|pair| match pair.as_list()? {
                [Value::Text(key), payload] => Some(LogicalItem::new(key.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Composite behaviour of an element type.
#[derive(Clone)]
pub struct CompositeSpec {
    pub mode: ExpansionMode,
    pub controlling: Vec<(String, Dependency)>,
    pub enumerate: EnumerateFn,
    /// Attributes consumed by the composite itself; all others are passed
    /// to link-mode replacement roots as overrides.
    pub own_attributes: Vec<String>,
}

impl CompositeSpec {
    pub fn new<F>(mode: ExpansionMode, enumerate: F) -> Self
    where
        F: Fn(&Deps<'_>, usize) -> Vec<LogicalItem> + Send + Sync + 'static,
    {
        Self {
            mode,
            controlling: Vec::new(),
            enumerate: Arc::new(enumerate),
            own_attributes: Vec::new(),
        }
    }

    pub fn controlled_by(mut self, name: &str, dependency: Dependency) -> Self {
        self.controlling.push((name.to_string(), dependency));
        self
    }

    pub fn consumes(mut self, attributes: &[&str]) -> Self {
        self.own_attributes
            .extend(attributes.iter().map(|a| a.to_string()));
        self
    }
}

impl fmt::Debug for CompositeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeSpec")
            .field("mode", &self.mode)
            .field("controlling", &self.controlling)
            .field("own_attributes", &self.own_attributes)
            .finish()
    }
}

/// Everything the engine knows about one element type.
#[derive(Debug, Clone)]
pub struct ElementType {
    pub name: String,
    pub capabilities: Vec<String>,
    pub primary: Option<String>,
    pub variables: Vec<StateVarSpec>,
    pub composite: Option<CompositeSpec>,
}

impl ElementType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: Vec::new(),
            primary: None,
            variables: Vec::new(),
            composite: None,
        }
    }

    pub fn capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }

    pub fn primary(mut self, variable: &str) -> Self {
        self.primary = Some(variable.to_string());
        self
    }

    pub fn variable(mut self, spec: StateVarSpec) -> Self {
        self.variables.push(spec);
        self
    }

    pub fn composite(mut self, spec: CompositeSpec) -> Self {
        self.composite = Some(spec);
        self
    }

    /// Whether the type matches a capability query. The type name itself
    /// always counts as a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.name == capability || self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    pub fn variable_spec(&self, name: &str) -> Option<&StateVarSpec> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Maps element-type names to their behaviour.
#[derive(Debug, Clone)]
pub struct Registry {
    types: IndexMap<String, Arc<ElementType>>,
}

impl Registry {
    /// A registry containing only the engine's built-in item host type.
    pub fn new() -> Self {
        let mut registry = Self {
            types: IndexMap::new(),
        };
        registry.register(standard::item_host());
        registry
    }

    /// A registry with the standard element library.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        standard::register_all(&mut registry);
        registry
    }

    /// Register a type, replacing any previous registration of the name.
    pub fn register(&mut self, element_type: ElementType) {
        self.types
            .insert(element_type.name.clone(), Arc::new(element_type));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ElementType>> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
