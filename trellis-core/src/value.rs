//! Values
//!
//! Every state variable holds a [`Value`]. Values are plain data: they can be
//! serialized, compared structurally, and cloned freely. Definitions receive
//! their inputs as [`DepValue`]s, which add the "absent" sentinel used when a
//! dependency does not resolve to anything.
//!
//! # Equality
//!
//! Equality is structural, with one deliberate deviation from IEEE-754:
//! `NaN` equals `NaN`. The forward evaluator compares a node's inputs against
//! the inputs of its last computation, and a NaN that compared unequal to
//! itself would force a recomputation on every pass.

use serde::{Deserialize, Serialize};

use crate::graph::ElementId;

/// The payload of a state variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// No value. Also used as the placeholder for errored nodes.
    #[default]
    Undefined,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    /// A reference to an element, produced by element-valued dependencies.
    Element(ElementId),
}

impl Value {
    /// Convenience constructor for a list of numbers.
    pub fn numbers<I>(items: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        Value::List(items.into_iter().map(Value::Number).collect())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Interpret the value as a number.
    ///
    /// Booleans map to 0/1 and text is parsed; anything else is `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness used by conditional constructs.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0 && !n.is_nan()),
            Value::Text(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<ElementId> {
        match self {
            Value::Element(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether every number contained in this value is finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite(),
            Value::List(items) => items.iter().all(Value::is_finite),
            _ => true,
        }
    }

    /// Structural comparison where numbers may differ by `tolerance`.
    pub fn approx_eq(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() || b.is_nan() {
                    a.is_nan() && b.is_nan()
                } else if a.is_infinite() || b.is_infinite() {
                    a == b
                } else {
                    (a - b).abs() <= tolerance
                }
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.approx_eq(y, tolerance))
            }
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Element(a), Value::Element(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<&serde_json::Value> for Value {
    /// Lossy conversion from loose JSON, used by the document loader for
    /// attribute literals written as bare JSON scalars.
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Undefined,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or_default(),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(_) => Value::Undefined,
        }
    }
}

/// The value a definition sees for one of its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DepValue {
    /// The dependency did not resolve to anything.
    Absent,
    /// A single-target dependency.
    One(Value),
    /// A multi-target dependency (attribute lists, subtree queries).
    Many(Vec<Value>),
}

impl DepValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, DepValue::Absent)
    }

    /// The single value, if this is a present single-target dependency.
    pub fn value(&self) -> Option<&Value> {
        match self {
            DepValue::One(v) => Some(v),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<f64> {
        self.value().and_then(Value::as_number)
    }

    /// Members of a multi-target dependency. A single value is a one-element
    /// slice and absence is empty.
    pub fn members(&self) -> &[Value] {
        match self {
            DepValue::Absent => &[],
            DepValue::One(v) => std::slice::from_ref(v),
            DepValue::Many(items) => items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_structurally_equal_to_nan() {
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Number(1.0), Value::Number(f64::NAN));
    }

    #[test]
    fn approx_eq_respects_tolerance() {
        let a = Value::numbers([1.0, 2.0]);
        let b = Value::numbers([1.0 + 1e-12, 2.0]);
        assert!(a.approx_eq(&b, 1e-9));
        assert!(!a.approx_eq(&Value::numbers([1.1, 2.0]), 1e-9));
        assert!(!a.approx_eq(&Value::numbers([1.0]), 1e-9));
    }

    #[test]
    fn finiteness_is_recursive() {
        assert!(Value::numbers([1.0, 2.0]).is_finite());
        assert!(!Value::numbers([1.0, f64::INFINITY]).is_finite());
        assert!(Value::Text("NaN".into()).is_finite());
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::Text(" 3.5 ".into()).as_number(), Some(3.5));
        assert_eq!(Value::Bool(true).as_number(), Some(1.0));
        assert_eq!(Value::Number(0.0).as_bool(), Some(false));
        assert_eq!(Value::Undefined.as_number(), None);
    }

    #[test]
    fn dep_value_members() {
        assert!(DepValue::Absent.members().is_empty());
        assert_eq!(DepValue::One(Value::Number(1.0)).members().len(), 1);
        assert_eq!(DepValue::Many(vec![Value::Bool(true); 3]).members().len(), 3);
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_string(&Value::Number(2.0)).unwrap();
        assert_eq!(json, r#"{"type":"number","value":2.0}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Number(2.0));
    }
}
