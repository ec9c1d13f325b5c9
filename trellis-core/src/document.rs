//! Document Declarations
//!
//! The markup loader hands the engine a [`Document`]: a static tree of
//! [`ElementDecl`]s whose attributes are either literal values or references
//! to other elements' state variables. The engine treats this tree as the
//! program it instantiates.
//!
//! # JSON form
//!
//! Attributes use a compact JSON encoding so hand-written fixtures stay
//! readable:
//!
//! - a string starting with `$` is a reference: `"$P1.x"` reads variable `x`
//!   of the element named `P1`, `"$m"` reads the primary variable of `m`
//! - a string starting with `\$` is a literal text beginning with `$`
//! - an array is a list of attributes
//! - `{"element": 7}` is a direct element reference
//! - anything else is a literal [`Value`]

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::ElementId;
use crate::value::Value;

/// An attribute expression on an element declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Attribute {
    Literal(Value),
    /// A reference to another element's state variable. `variable: None`
    /// selects the target type's primary variable.
    Ref {
        name: String,
        variable: Option<String>,
    },
    List(Vec<Attribute>),
    /// A direct element reference. Generated copies use this to point at
    /// their source without going through name lookup.
    Element(ElementId),
}

impl Attribute {
    pub fn literal(value: impl Into<Value>) -> Self {
        Attribute::Literal(value.into())
    }

    pub fn reference(name: impl Into<String>, variable: Option<&str>) -> Self {
        Attribute::Ref {
            name: name.into(),
            variable: variable.map(str::to_string),
        }
    }

    /// Parse the `$name.variable` reference syntax.
    pub fn parse_ref(text: &str) -> Option<Self> {
        let body = text.strip_prefix('$')?;
        if body.is_empty() {
            return None;
        }
        let (name, variable) = match body.split_once('.') {
            Some((name, variable)) if !variable.is_empty() => (name, Some(variable)),
            _ => (body, None),
        };
        Some(Attribute::reference(name, variable))
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Attribute::Literal(v) => Some(v),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Attribute {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::String(s) => {
                if let Some(rest) = s.strip_prefix("\\$") {
                    Attribute::Literal(Value::Text(format!("${rest}")))
                } else {
                    Attribute::parse_ref(&s).unwrap_or(Attribute::Literal(Value::Text(s)))
                }
            }
            serde_json::Value::Array(items) => {
                Attribute::List(items.into_iter().map(Attribute::from).collect())
            }
            serde_json::Value::Object(map) => match map.get("element").and_then(|v| v.as_u64()) {
                Some(id) => Attribute::Element(ElementId::from(id as u32)),
                None => Attribute::Literal(Value::Undefined),
            },
            other => Attribute::Literal(Value::from(&other)),
        }
    }
}

impl From<Attribute> for serde_json::Value {
    fn from(attribute: Attribute) -> Self {
        match attribute {
            Attribute::Literal(Value::Text(s)) if s.starts_with('$') => {
                serde_json::Value::String(format!("\\{s}"))
            }
            Attribute::Literal(value) => literal_to_json(&value),
            Attribute::Ref { name, variable } => serde_json::Value::String(match variable {
                Some(variable) => format!("${name}.{variable}"),
                None => format!("${name}"),
            }),
            Attribute::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Attribute::Element(id) => serde_json::json!({ "element": id.raw() }),
        }
    }
}

fn literal_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(literal_to_json).collect()),
        Value::Element(id) => serde_json::json!({ "element": id.raw() }),
    }
}

/// One declared element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDecl {
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementDecl>,
}

impl ElementDecl {
    pub fn new(element_type: impl Into<String>) -> Self {
        Self {
            element_type: element_type.into(),
            name: None,
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    /// Literal attribute shorthand.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attr(name, Attribute::literal(value))
    }

    /// Reference attribute shorthand using the `$name.variable` syntax.
    pub fn bind(self, name: impl Into<String>, reference: &str) -> Self {
        let attribute = Attribute::parse_ref(reference)
            .unwrap_or_else(|| Attribute::literal(reference));
        self.attr(name, attribute)
    }

    pub fn child(mut self, child: ElementDecl) -> Self {
        self.children.push(child);
        self
    }

    /// Pre-order walk over this declaration and its descendants.
    pub fn walk(&self) -> Box<dyn Iterator<Item = &ElementDecl> + '_> {
        Box::new(std::iter::once(self).chain(self.children.iter().flat_map(|c| c.walk())))
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '$']) && !name.chars().any(char::is_whitespace)
}

fn check_references(attribute: &Attribute) -> Result<(), String> {
    match attribute {
        Attribute::Ref { name, variable } => {
            let variable_ok = variable.as_deref().map_or(true, is_valid_name);
            if is_valid_name(name) && variable_ok {
                Ok(())
            } else {
                Err(match variable {
                    Some(variable) => format!("${name}.{variable}"),
                    None => format!("${name}"),
                })
            }
        }
        Attribute::List(items) => items.iter().try_for_each(check_references),
        Attribute::Literal(_) | Attribute::Element(_) => Ok(()),
    }
}

/// A complete document: the top-level element declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub children: Vec<ElementDecl>,
}

impl Document {
    pub fn new(children: Vec<ElementDecl>) -> Self {
        Self { children }
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let document: Self = serde_json::from_str(json)?;
        document.validate()?;
        Ok(document)
    }

    /// Check the declarations for structural mistakes: empty type names,
    /// names the reference syntax cannot reach, and malformed references.
    pub fn validate(&self) -> Result<(), EngineError> {
        for decl in self.walk() {
            if decl.element_type.is_empty() {
                return Err(EngineError::InvalidDocument("element with an empty type".into()));
            }
            if let Some(name) = &decl.name {
                if !is_valid_name(name) {
                    return Err(EngineError::InvalidDocument(format!(
                        "'{name}' is not a valid element name"
                    )));
                }
            }
            for (attribute, value) in &decl.attributes {
                check_references(value).map_err(|reference| {
                    EngineError::InvalidDocument(format!(
                        "attribute '{attribute}' of '{}' has malformed reference '{reference}'",
                        decl.element_type
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub fn walk(&self) -> impl Iterator<Item = &ElementDecl> {
        self.children.iter().flat_map(|c| c.walk())
    }
}
