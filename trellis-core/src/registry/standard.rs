//! The standard element library.
//!
//! A deliberately small set of types: enough to build documents with
//! numbers, points and the four composite constructs. Hosts embedding the
//! engine register their own types next to these.

use crate::error::Refusal;
use crate::graph::{Dependency, ItemField, Selector, Target};
use crate::value::{DepValue, Value};

use super::{
    sole_modifiable, CompositeSpec, Derivation, ElementType, ExpansionMode, InverseResult,
    LogicalItem, Registry, StateVarSpec, ITEM_TYPE,
};

/// Register every standard type.
pub fn register_all(registry: &mut Registry) {
    registry.register(number());
    registry.register(boolean());
    registry.register(text());
    registry.register(sum());
    registry.register(point());
    registry.register(group());
    registry.register(square_root());
    registry.register(copy());
    registry.register(repeat());
    registry.register(conditional());
    registry.register(collect());
}

/// Host element the engine creates for each template-mode item. Exposes the
/// item's payload as `value` and its 1-based position as `index`.
pub fn item_host() -> ElementType {
    ElementType::new(ITEM_TYPE)
        .primary("value")
        .variable(StateVarSpec::derived(
            "value",
            Derivation::new(|deps| deps.value("item").cloned().unwrap_or_default())
                .depends_on("item", Dependency::Item(ItemField::Value)),
        ))
        .variable(StateVarSpec::derived(
            "index",
            Derivation::new(|deps| deps.value("item").cloned().unwrap_or_default())
                .depends_on("item", Dependency::Item(ItemField::Index)),
        ))
}

pub fn number() -> ElementType {
    ElementType::new("number")
        .capability("math")
        .primary("value")
        .variable(StateVarSpec::attribute("value", "value", Value::Number(0.0)))
}

pub fn boolean() -> ElementType {
    ElementType::new("boolean")
        .primary("value")
        .variable(StateVarSpec::attribute("value", "value", Value::Bool(false)))
}

pub fn text() -> ElementType {
    ElementType::new("text")
        .primary("value")
        .variable(StateVarSpec::attribute("value", "value", Value::Text(String::new())))
}

/// `value = Σ terms`. Inverts through the single modifiable term.
pub fn sum() -> ElementType {
    let derivation = Derivation::new(|deps| {
        let total = deps
            .members("terms")
            .iter()
            .map(|term| term.as_number().unwrap_or(f64::NAN))
            .sum::<f64>();
        Value::Number(total)
    })
    .depends_on("terms", Dependency::attribute("terms"))
    .invert_with(|desired, deps| {
        let Some(desired) = desired.as_number() else {
            return InverseResult::Refused(Refusal::Mismatch);
        };
        let member = match sole_modifiable(deps, "terms") {
            Ok(member) => member,
            Err(refusal) => return InverseResult::Refused(refusal),
        };
        let others: f64 = deps
            .members("terms")
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != member)
            .map(|(_, term)| term.as_number().unwrap_or(f64::NAN))
            .sum();
        let wanted = Value::Number(desired - others);
        match deps.get("terms") {
            DepValue::Many(_) => InverseResult::set_member("terms", member, wanted),
            _ => InverseResult::set("terms", wanted),
        }
    });

    ElementType::new("sum")
        .capability("math")
        .primary("value")
        .variable(StateVarSpec::derived("value", derivation))
}

/// A draggable point. Dragging sets `coords`, which inverts into `x` then
/// `y` as two independent branches.
pub fn point() -> ElementType {
    let coords = Derivation::new(|deps| {
        Value::List(vec![
            deps.value("x").cloned().unwrap_or_default(),
            deps.value("y").cloned().unwrap_or_default(),
        ])
    })
    .depends_on("x", Dependency::own("x"))
    .depends_on("y", Dependency::own("y"))
    .invert_with(|desired, _| match desired.as_list() {
        Some([x, y]) => InverseResult::set("x", x.clone()).and("y", y.clone()),
        _ => InverseResult::Refused(Refusal::Mismatch),
    });

    ElementType::new("point")
        .capability("graphical")
        .primary("coords")
        .variable(StateVarSpec::attribute("x", "x", Value::Number(0.0)))
        .variable(StateVarSpec::attribute("y", "y", Value::Number(0.0)))
        .variable(StateVarSpec::derived("coords", coords))
}

pub fn group() -> ElementType {
    ElementType::new("group")
        .capability("container")
        .variable(StateVarSpec::attribute("hidden", "hidden", Value::Bool(false)))
}

/// Square root computed by Newton iteration from its own previous value.
pub fn square_root() -> ElementType {
    let derivation = Derivation::new(|deps| {
        let Some(radicand) = deps.number("radicand") else {
            return Value::Undefined;
        };
        if radicand.is_nan() || radicand < 0.0 {
            return Value::Number(f64::NAN);
        }
        if radicand == 0.0 || radicand.is_infinite() {
            return Value::Number(radicand);
        }
        let guess = deps
            .number("previous")
            .filter(|g| g.is_finite() && *g > 0.0)
            .unwrap_or(radicand.max(1.0));
        Value::Number((guess + radicand / guess) / 2.0)
    })
    .depends_on("radicand", Dependency::attribute("radicand"))
    .depends_on("previous", Dependency::Previous)
    .convergent()
    .invert_with(|desired, _| match desired.as_number() {
        Some(root) if root >= 0.0 => InverseResult::set("radicand", Value::Number(root * root)),
        _ => InverseResult::Refused(Refusal::Mismatch),
    });

    ElementType::new("square_root")
        .capability("math")
        .primary("value")
        .variable(StateVarSpec::derived("value", derivation))
}

fn element_items(members: &[Value], limit: usize) -> Vec<LogicalItem> {
    members
        .iter()
        .filter_map(Value::as_element)
        .take(limit)
        .map(|id| LogicalItem::new(id.to_string(), Value::Element(id)))
        .collect()
}

/// Linked copy of `source`. A composite source is copied through its
/// current replacements.
pub fn copy() -> ElementType {
    let spec = CompositeSpec::new(ExpansionMode::Link, |deps, limit| {
        match deps.get("replacements") {
            DepValue::Absent => element_items(deps.members("source"), limit),
            replacements => element_items(replacements.members(), limit),
        }
    })
    .controlled_by("source", Dependency::Element(Target::Attribute("source".into())))
    .controlled_by(
        "replacements",
        Dependency::Replacements(Target::Attribute("source".into())),
    )
    .consumes(&["source"]);

    ElementType::new("copy").composite(spec)
}

/// Template instantiated once per item of `over`, or for `count` items, or
/// for each number in `from..=to`.
pub fn repeat() -> ElementType {
    let spec = CompositeSpec::new(ExpansionMode::Template, |deps, limit| {
        let payloads: Vec<Value> = if !deps.get("over").is_absent() {
            match deps.get("over") {
                DepValue::One(Value::List(items)) => items.iter().take(limit).cloned().collect(),
                other => other.members().iter().take(limit).cloned().collect(),
            }
        } else if let (Some(from), Some(to)) = (deps.number("from"), deps.number("to")) {
            let n = bounded_count(to - from + 1.0, limit);
            (0..n).map(|i| Value::Number(from + i as f64)).collect()
        } else {
            let n = bounded_count(deps.number("count").unwrap_or(0.0), limit);
            (1..=n).map(|i| Value::Number(i as f64)).collect()
        };
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| LogicalItem::new((i + 1).to_string(), payload))
            .collect()
    })
    .controlled_by("over", Dependency::attribute("over"))
    .controlled_by("count", Dependency::attribute("count"))
    .controlled_by("from", Dependency::attribute("from"))
    .controlled_by("to", Dependency::attribute("to"))
    .consumes(&["over", "count", "from", "to", "valueName", "indexName"]);

    ElementType::new("repeat").composite(spec)
}

fn bounded_count(n: f64, limit: usize) -> usize {
    if n.is_finite() && n >= 1.0 {
        (n.floor() as usize).min(limit)
    } else {
        0
    }
}

/// Template included while `condition` is truthy.
pub fn conditional() -> ElementType {
    let spec = CompositeSpec::new(ExpansionMode::Template, |deps, limit| {
        let shown = deps
            .value("condition")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if shown && limit > 0 {
            vec![LogicalItem::new("1", Value::Bool(true))]
        } else {
            Vec::new()
        }
    })
    .controlled_by("condition", Dependency::attribute("condition"))
    .consumes(&["condition"]);

    ElementType::new("conditional").composite(spec)
}

/// Linked copies of every descendant of `source` with the capability named
/// by `componentType`.
pub fn collect() -> ElementType {
    let spec = CompositeSpec::new(ExpansionMode::Link, |deps, limit| {
        element_items(deps.members("items"), limit)
    })
    .controlled_by(
        "items",
        Dependency::Descendants {
            of: Target::Attribute("source".into()),
            selector: Selector::CapabilityFromAttribute("componentType".into()),
            variable: None,
        },
    )
    .consumes(&["source", "componentType"]);

    ElementType::new("collect").composite(spec)
}
