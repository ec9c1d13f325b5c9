//! Integration Tests for the Engine
//!
//! These tests drive whole documents through `Engine` the way a renderer
//! would: build, issue actions, read values back.

use trellis_core::{
    Action, ActionOutcome, Attribute, Derivation, Diagnostic, Document, ElementDecl, ElementId,
    ElementType, Engine, EngineConfig, EngineError, InverseResult, NodeKey, Refusal, Registry,
    StateVarSpec, Value,
};
use trellis_core::graph::Dependency;

fn coords(engine: &Engine, name: &str) -> Value {
    let key = engine.key(name, "coords").unwrap();
    engine.value(&key).cloned().unwrap()
}

fn drag(engine: &mut Engine, name: &str, x: f64, y: f64) -> ActionOutcome {
    let key = engine.key(name, "coords").unwrap();
    engine
        .apply_action(Action::settled(key, Value::numbers([x, y])))
        .unwrap()
}

fn set_number(engine: &mut Engine, name: &str, value: f64) -> ActionOutcome {
    let key = engine.key(name, "value").unwrap();
    engine
        .apply_action(Action::settled(key, Value::Number(value)))
        .unwrap()
}

fn mirrored_points() -> Document {
    Document::new(vec![
        ElementDecl::new("point").named("P1").with("x", 1.0).with("y", 2.0),
        ElementDecl::new("point")
            .named("P2")
            .bind("x", "$P1.y")
            .bind("y", "$P1.x"),
    ])
}

fn repeated_points(n: f64) -> Document {
    Document::new(vec![
        ElementDecl::new("number").named("n").with("value", n),
        ElementDecl::new("repeat")
            .named("R")
            .bind("count", "$n")
            .child(ElementDecl::new("point")),
    ])
}

fn refused(outcome: &ActionOutcome, reason: Refusal) -> bool {
    outcome
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::InversionRefused { reason: r, .. } if *r == reason))
}

// ── Scenarios ───────────────────────────────────────────────────────

#[test]
fn mirrored_points_move_together() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    assert_eq!(coords(&engine, "P2"), Value::numbers([2.0, 1.0]));

    let outcome = drag(&mut engine, "P1", -4.0, 9.0);
    assert!(outcome.accepted);
    assert_eq!(coords(&engine, "P1"), Value::numbers([-4.0, 9.0]));
    assert_eq!(coords(&engine, "P2"), Value::numbers([9.0, -4.0]));
    let p2 = engine.key("P2", "coords").unwrap();
    assert_eq!(outcome.changed.get(&p2), Some(&Value::numbers([9.0, -4.0])));

    let outcome = drag(&mut engine, "P2", 5.0, -7.0);
    assert!(outcome.accepted);
    assert_eq!(coords(&engine, "P1"), Value::numbers([-7.0, 5.0]));
    assert_eq!(coords(&engine, "P2"), Value::numbers([5.0, -7.0]));
}

#[test]
fn repeat_restores_coordinates_after_shrinking_to_zero() {
    let mut engine = Engine::new(&repeated_points(2.0)).unwrap();
    let repeat = engine.element_named("R").unwrap();
    let hosts = engine.replacements(repeat);
    assert_eq!(hosts.len(), 2);

    let first = engine.element(hosts[0]).unwrap().children[0];
    let second = engine.element(hosts[1]).unwrap().children[0];
    let first_coords = NodeKey::new(first, "coords");
    let second_coords = NodeKey::new(second, "coords");
    for (key, xy) in [(&first_coords, [3.0, 4.0]), (&second_coords, [-1.0, 6.0])] {
        engine
            .apply_action(Action::settled(key.clone(), Value::numbers(xy)))
            .unwrap();
    }

    let outcome = set_number(&mut engine, "n", 0.0);
    assert!(engine.replacements(repeat).is_empty());
    assert!(outcome.removed.contains(&first_coords));
    assert_eq!(engine.value(&first_coords), None);

    let outcome = set_number(&mut engine, "n", 2.0);
    assert_eq!(engine.replacements(repeat), hosts);
    assert_eq!(engine.value(&first_coords), Some(&Value::numbers([3.0, 4.0])));
    assert_eq!(engine.value(&second_coords), Some(&Value::numbers([-1.0, 6.0])));
    assert_eq!(
        outcome.changed.get(&second_coords),
        Some(&Value::numbers([-1.0, 6.0]))
    );
}

#[test]
fn dragging_a_point_bound_to_an_ambiguous_sum_moves_only_y() {
    let document = Document::new(vec![
        ElementDecl::new("number").named("a").with("value", 1.0),
        ElementDecl::new("number").named("b").with("value", 2.0),
        ElementDecl::new("sum").named("s").attr(
            "terms",
            Attribute::List(vec![
                Attribute::reference("a", None),
                Attribute::reference("b", None),
            ]),
        ),
        ElementDecl::new("point").named("P").bind("x", "$s").with("y", 0.0),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    assert_eq!(coords(&engine, "P"), Value::numbers([3.0, 0.0]));

    let outcome = drag(&mut engine, "P", 10.0, 7.0);
    assert!(outcome.accepted, "the y branch succeeded");
    assert!(refused(&outcome, Refusal::Ambiguous));
    assert_eq!(coords(&engine, "P"), Value::numbers([3.0, 7.0]));
    let a = engine.key("a", "value").unwrap();
    assert_eq!(engine.value(&a), Some(&Value::Number(1.0)));
}

#[test]
fn fixed_terms_leave_a_single_degree_of_freedom() {
    let document = Document::new(vec![
        ElementDecl::new("number").named("a").with("value", 1.0).with("fixed", true),
        ElementDecl::new("number").named("b").with("value", 2.0),
        ElementDecl::new("sum").named("s").attr(
            "terms",
            Attribute::List(vec![
                Attribute::reference("a", None),
                Attribute::reference("b", None),
            ]),
        ),
        ElementDecl::new("point").named("P").bind("x", "$s"),
    ]);
    let mut engine = Engine::new(&document).unwrap();

    let outcome = drag(&mut engine, "P", 10.0, 7.0);
    assert!(outcome.accepted);
    assert_eq!(coords(&engine, "P"), Value::numbers([10.0, 7.0]));
    let b = engine.key("b", "value").unwrap();
    assert_eq!(engine.value(&b), Some(&Value::Number(9.0)));
}

#[test]
fn first_branch_wins_when_both_coordinates_share_a_source() {
    let document = Document::new(vec![
        ElementDecl::new("number").named("m").with("value", 1.0),
        ElementDecl::new("point").named("P").bind("x", "$m").bind("y", "$m"),
    ]);
    let mut engine = Engine::new(&document).unwrap();

    let outcome = drag(&mut engine, "P", 3.0, 5.0);
    assert!(outcome.accepted);
    assert!(refused(&outcome, Refusal::Conflict));
    assert_eq!(coords(&engine, "P"), Value::numbers([3.0, 3.0]));
}

#[test]
fn fixed_points_refuse_and_keep_their_values() {
    let document = Document::new(vec![ElementDecl::new("point")
        .named("P")
        .with("x", 1.0)
        .with("y", 1.0)
        .with("fixed", true)]);
    let mut engine = Engine::new(&document).unwrap();

    let outcome = drag(&mut engine, "P", 4.0, 4.0);
    assert!(!outcome.accepted);
    assert!(outcome.changed.is_empty());
    assert!(refused(&outcome, Refusal::Fixed));
    assert_eq!(coords(&engine, "P"), Value::numbers([1.0, 1.0]));
}

#[test]
fn non_finite_values_are_refused() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    let outcome = drag(&mut engine, "P1", f64::NAN, 1.0);
    assert!(!outcome.accepted);
    assert!(refused(&outcome, Refusal::NonFinite));
    assert_eq!(coords(&engine, "P1"), Value::numbers([1.0, 2.0]));
}

#[test]
fn unknown_targets_are_errors() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    let key = NodeKey::new(ElementId::from(42), "coords");
    let err = engine
        .apply_action(Action::settled(key, Value::Number(1.0)))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownNode(_)));
}

// ── Cycles and convergence ──────────────────────────────────────────

#[test]
fn cycles_are_localized() {
    let document = Document::new(vec![
        ElementDecl::new("point").named("A").bind("x", "$B.x"),
        ElementDecl::new("point").named("B").bind("x", "$A.x"),
        ElementDecl::new("point").named("C").with("x", 2.0).with("y", 3.0),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    assert!(engine
        .diagnostics()
        .iter()
        .any(|d| matches!(d, Diagnostic::CycleDetected { .. })));
    assert_eq!(coords(&engine, "C"), Value::numbers([2.0, 3.0]));

    let outcome = drag(&mut engine, "C", 5.0, 6.0);
    assert!(outcome.accepted);
    assert_eq!(coords(&engine, "C"), Value::numbers([5.0, 6.0]));
}

#[test]
fn square_root_converges_and_inverts() {
    let document = Document::new(vec![
        ElementDecl::new("number").named("r").with("value", 2.0),
        ElementDecl::new("square_root").named("q").bind("radicand", "$r"),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    let q = engine.key("q", "value").unwrap();
    let root = engine.value(&q).and_then(Value::as_number).unwrap();
    assert!((root - 2f64.sqrt()).abs() < 1e-9);

    let outcome = set_number(&mut engine, "q", 4.0);
    assert!(outcome.accepted);
    let r = engine.key("r", "value").unwrap();
    assert_eq!(engine.value(&r), Some(&Value::Number(16.0)));
    let root = engine.evaluate(&q).unwrap().as_number().unwrap();
    assert!((root - 4.0).abs() < 1e-9);
}

// ── Composites ──────────────────────────────────────────────────────

#[test]
fn copies_edit_their_source() {
    let document = Document::new(vec![
        ElementDecl::new("point").named("P").with("x", 1.0).with("y", 2.0),
        ElementDecl::new("copy").named("C").bind("source", "$P"),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    let copy = engine.element_named("C").unwrap();
    let roots = engine.replacements(copy);
    assert_eq!(roots.len(), 1);
    assert_eq!(engine.element(roots[0]).unwrap().link, engine.element_named("P"));
    assert_eq!(coords(&engine, "C"), Value::numbers([1.0, 2.0]));

    drag(&mut engine, "C", 4.0, 5.0);
    assert_eq!(coords(&engine, "P"), Value::numbers([4.0, 5.0]));
    assert_eq!(coords(&engine, "C"), Value::numbers([4.0, 5.0]));
}

#[test]
fn copy_attributes_override_the_source() {
    let document = Document::new(vec![
        ElementDecl::new("point").named("P").with("x", 1.0).with("y", 2.0),
        ElementDecl::new("copy").named("C").bind("source", "$P").with("y", 9.0),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    assert_eq!(coords(&engine, "C"), Value::numbers([1.0, 9.0]));

    drag(&mut engine, "C", 4.0, 5.0);
    assert_eq!(coords(&engine, "P"), Value::numbers([4.0, 2.0]));
    assert_eq!(coords(&engine, "C"), Value::numbers([4.0, 5.0]));
}

#[test]
fn copying_a_repeat_follows_its_replacements() {
    let document = Document::new(vec![
        ElementDecl::new("number").named("n").with("value", 2.0),
        ElementDecl::new("repeat")
            .named("R")
            .bind("count", "$n")
            .child(ElementDecl::new("point")),
        ElementDecl::new("copy").named("C").bind("source", "$R"),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    let copy = engine.element_named("C").unwrap();
    let repeat = engine.element_named("R").unwrap();
    assert_eq!(engine.replacements(copy).len(), 2);
    let links: Vec<_> = engine
        .replacements(copy)
        .iter()
        .map(|id| engine.element(*id).unwrap().link.unwrap())
        .collect();
    assert_eq!(links, engine.replacements(repeat));

    set_number(&mut engine, "n", 3.0);
    assert_eq!(engine.replacements(copy).len(), 3);
}

#[test]
fn conditional_shows_and_hides_its_template() {
    let document = Document::new(vec![
        ElementDecl::new("boolean").named("show").with("value", false),
        ElementDecl::new("conditional")
            .named("when")
            .bind("condition", "$show")
            .child(ElementDecl::new("point").named("Q").with("x", 5.0)),
    ]);
    let mut engine = Engine::new(&document).unwrap();
    let conditional = engine.element_named("when").unwrap();
    assert!(engine.replacements(conditional).is_empty());

    let show = engine.key("show", "value").unwrap();
    let outcome = engine
        .apply_action(Action::settled(show.clone(), Value::Bool(true)))
        .unwrap();
    let hosts = engine.replacements(conditional);
    assert_eq!(hosts.len(), 1);
    let point = engine.element(hosts[0]).unwrap().children[0];
    let x = NodeKey::new(point, "x");
    assert_eq!(outcome.changed.get(&x), Some(&Value::Number(5.0)));
    assert_eq!(engine.resolve_name(point, "Q"), Some(point));

    engine
        .apply_action(Action::settled(show, Value::Bool(false)))
        .unwrap();
    assert!(engine.replacements(conditional).is_empty());
    assert_eq!(engine.value(&x), None);
}

#[test]
fn repeat_items_expose_value_and_index() {
    let document = Document::new(vec![ElementDecl::new("repeat")
        .named("R")
        .with("from", 5.0)
        .with("to", 7.0)
        .with("valueName", "v")
        .with("indexName", "i")
        .child(ElementDecl::new("point").bind("x", "$v").bind("y", "$i"))]);
    let mut engine = Engine::new(&document).unwrap();
    let repeat = engine.element_named("R").unwrap();
    let points: Vec<Value> = engine
        .replacements(repeat)
        .iter()
        .map(|host| {
            let point = engine.element(*host).unwrap().children[0];
            engine.value(&NodeKey::new(point, "coords")).cloned().unwrap()
        })
        .collect();
    assert_eq!(
        points,
        vec![
            Value::numbers([5.0, 1.0]),
            Value::numbers([6.0, 2.0]),
            Value::numbers([7.0, 3.0]),
        ]
    );
}

#[test]
fn collect_copies_matching_descendants() {
    let document = Document::new(vec![
        ElementDecl::new("group")
            .named("G")
            .child(ElementDecl::new("point").named("A").with("x", 1.0))
            .child(ElementDecl::new("number").named("k"))
            .child(ElementDecl::new("point").named("B").with("x", 2.0)),
        ElementDecl::new("collect")
            .named("all")
            .bind("source", "$G")
            .with("componentType", "graphical"),
    ]);
    let engine = Engine::new(&document).unwrap();
    let collect = engine.element_named("all").unwrap();
    let links: Vec<_> = engine
        .replacements(collect)
        .iter()
        .map(|id| engine.element(*id).unwrap().link)
        .collect();
    assert_eq!(links, vec![engine.element_named("A"), engine.element_named("B")]);
}

#[test]
fn collect_inside_its_source_skips_itself() {
    let document = Document::new(vec![ElementDecl::new("group")
        .named("G")
        .child(ElementDecl::new("point").named("A"))
        .child(
            ElementDecl::new("collect")
                .named("all")
                .bind("source", "$G")
                .with("componentType", "point"),
        )]);
    let engine = Engine::new(&document).unwrap();
    let collect = engine.element_named("all").unwrap();
    assert_eq!(engine.replacements(collect).len(), 1);
    assert!(!engine
        .diagnostics()
        .iter()
        .any(|d| matches!(d, Diagnostic::ExpansionNonTermination { .. })));
}

#[test]
fn copying_an_enclosing_element_is_cut_off() {
    let document = Document::new(vec![ElementDecl::new("group")
        .named("G")
        .child(ElementDecl::new("point"))
        .child(ElementDecl::new("copy").named("C").bind("source", "$G"))]);
    let engine = Engine::new(&document).unwrap();
    let copy = engine.element_named("C").unwrap();
    assert!(engine.replacements(copy).is_empty());
    assert!(engine.diagnostics().iter().any(|d| matches!(
        d,
        Diagnostic::ExpansionNonTermination { composite, .. } if *composite == copy
    )));
}

#[test]
fn nesting_beyond_the_depth_limit_is_cut_off() {
    let document = Document::new(vec![ElementDecl::new("repeat")
        .named("outer")
        .with("count", 2.0)
        .child(
            ElementDecl::new("repeat")
                .with("count", 2.0)
                .child(ElementDecl::new("point")),
        )]);
    let config = EngineConfig {
        max_expansion_depth: 1,
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(&document, config).unwrap();
    let outer = engine.element_named("outer").unwrap();
    let hosts = engine.replacements(outer);
    assert_eq!(hosts.len(), 2);
    for host in hosts {
        let inner = engine.element(host).unwrap().children[0];
        assert!(engine.replacements(inner).is_empty());
    }
    let halted = engine
        .diagnostics()
        .iter()
        .filter(|d| matches!(d, Diagnostic::ExpansionNonTermination { .. }))
        .count();
    assert_eq!(halted, 2);
}

#[test]
fn shrink_then_grow_preserves_identity() {
    let mut engine = Engine::new(&repeated_points(3.0)).unwrap();
    let repeat = engine.element_named("R").unwrap();
    let before = engine.replacements(repeat);
    let third = engine.element_at("/1[3]/0").unwrap();

    set_number(&mut engine, "n", 1.0);
    assert_eq!(engine.replacements(repeat), before[..1].to_vec());
    assert_eq!(engine.element_at("/1[3]/0"), None);

    set_number(&mut engine, "n", 3.0);
    assert_eq!(engine.replacements(repeat), before);
    assert_eq!(engine.element_at("/1[3]/0"), Some(third));
}

// ── Transient actions, undo, snapshots ──────────────────────────────

#[test]
fn transient_runs_equal_their_final_action() {
    let mut dragged = Engine::new(&mirrored_points()).unwrap();
    let key = dragged.key("P1", "coords").unwrap();
    for xy in [[1.5, 2.5], [3.0, 4.0]] {
        dragged
            .apply_action(Action::transient(key.clone(), Value::numbers(xy)))
            .unwrap();
    }
    assert!(dragged.has_pending_transient());
    dragged
        .apply_action(Action::settled(key.clone(), Value::numbers([5.0, 6.0])))
        .unwrap();
    assert!(!dragged.has_pending_transient());

    let mut direct = Engine::new(&mirrored_points()).unwrap();
    direct
        .apply_action(Action::settled(key, Value::numbers([5.0, 6.0])))
        .unwrap();

    assert_eq!(dragged.evaluate_all(), direct.evaluate_all());
    assert_eq!(dragged.history_len(), 1);
}

#[test]
fn repeated_transients_are_idempotent() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    let key = engine.key("P1", "coords").unwrap();
    let action = Action::transient(key, Value::numbers([8.0, 9.0]));

    let first = engine.apply_action(action.clone()).unwrap();
    assert!(!first.changed.is_empty());
    let state = engine.evaluate_all();
    let second = engine.apply_action(action).unwrap();
    assert!(second.changed.is_empty());
    assert_eq!(engine.evaluate_all(), state);
}

#[test]
fn an_action_on_another_target_commits_the_run() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    let p1 = engine.key("P1", "coords").unwrap();
    let p2 = engine.key("P2", "coords").unwrap();
    engine
        .apply_action(Action::transient(p1, Value::numbers([8.0, 9.0])))
        .unwrap();
    engine
        .apply_action(Action::settled(p2, Value::numbers([0.0, 0.0])))
        .unwrap();
    assert_eq!(engine.history_len(), 2);

    engine.undo();
    assert_eq!(coords(&engine, "P1"), Value::numbers([8.0, 9.0]));
    engine.undo();
    assert_eq!(coords(&engine, "P1"), Value::numbers([1.0, 2.0]));
}

/// `n` points, each with `x` bound to `n`: dragging the last one left
/// shrinks the repeat and removes the point being dragged.
fn self_sizing_repeat() -> Document {
    Document::new(vec![
        ElementDecl::new("number").named("n").with("value", 2.0),
        ElementDecl::new("repeat")
            .named("R")
            .bind("count", "$n")
            .child(ElementDecl::new("point").bind("x", "$n")),
    ])
}

fn last_point(engine: &Engine) -> NodeKey {
    let repeat = engine.element_named("R").unwrap();
    let hosts = engine.replacements(repeat);
    let point = engine.element(hosts[hosts.len() - 1]).unwrap().children[0];
    NodeKey::new(point, "coords")
}

#[test]
fn a_run_can_continue_on_a_target_it_removed() {
    let mut dragged = Engine::new(&self_sizing_repeat()).unwrap();
    let target = last_point(&dragged);
    dragged
        .apply_action(Action::transient(target.clone(), Value::numbers([1.0, 5.0])))
        .unwrap();
    assert_eq!(dragged.value(&target), None);

    // The baseline brings the point back before the next step inverts.
    let outcome = dragged
        .apply_action(Action::transient(target.clone(), Value::numbers([3.0, 7.0])))
        .unwrap();
    assert!(outcome.accepted);
    dragged
        .apply_action(Action::settled(target.clone(), Value::numbers([3.0, 7.0])))
        .unwrap();
    assert_eq!(dragged.value(&target), Some(&Value::numbers([3.0, 7.0])));

    let mut direct = Engine::new(&self_sizing_repeat()).unwrap();
    direct
        .apply_action(Action::settled(target, Value::numbers([3.0, 7.0])))
        .unwrap();
    assert_eq!(dragged.evaluate_all(), direct.evaluate_all());
    assert_eq!(dragged.history_len(), 1);
    assert_eq!(direct.history_len(), 1);

    // Outside a run, a removed target is unknown.
    let gone = last_point(&direct);
    set_number(&mut direct, "n", 1.0);
    let err = direct
        .apply_action(Action::settled(gone, Value::numbers([0.0, 0.0])))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownNode(_)));
}

#[test]
fn undo_reverts_committed_actions() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    drag(&mut engine, "P1", -4.0, 9.0);
    drag(&mut engine, "P1", 0.0, 0.0);

    let outcome = engine.undo();
    assert!(outcome.accepted);
    assert_eq!(coords(&engine, "P1"), Value::numbers([-4.0, 9.0]));
    assert_eq!(coords(&engine, "P2"), Value::numbers([9.0, -4.0]));

    engine.undo();
    assert_eq!(coords(&engine, "P1"), Value::numbers([1.0, 2.0]));
    assert!(!engine.undo().accepted);
}

#[test]
fn undo_restores_removed_replacements() {
    let mut engine = Engine::new(&repeated_points(2.0)).unwrap();
    let repeat = engine.element_named("R").unwrap();
    let hosts = engine.replacements(repeat);
    set_number(&mut engine, "n", 0.0);
    assert!(engine.replacements(repeat).is_empty());

    engine.undo();
    assert_eq!(engine.replacements(repeat), hosts);
}

#[test]
fn saved_state_restores_into_a_fresh_engine() {
    let mut engine = Engine::new(&repeated_points(2.0)).unwrap();
    let repeat = engine.element_named("R").unwrap();
    let point = engine.element(engine.replacements(repeat)[1]).unwrap().children[0];
    let key = NodeKey::new(point, "coords");
    engine
        .apply_action(Action::settled(key.clone(), Value::numbers([7.0, 8.0])))
        .unwrap();
    set_number(&mut engine, "n", 3.0);
    let bytes = engine.save_state().unwrap();

    let mut restored = Engine::new(&repeated_points(2.0)).unwrap();
    restored.restore_state(&bytes).unwrap();
    assert_eq!(restored.evaluate_all(), engine.evaluate_all());
    assert_eq!(restored.value(&key), Some(&Value::numbers([7.0, 8.0])));
    assert_eq!(restored.history_len(), 0);
}

#[test]
fn corrupt_snapshots_are_rejected() {
    let mut engine = Engine::new(&mirrored_points()).unwrap();
    let err = engine.restore_state(&[0xc1, 0x00, 0x13]).unwrap_err();
    assert!(matches!(err, EngineError::Decode(_)));
    assert_eq!(coords(&engine, "P1"), Value::numbers([1.0, 2.0]));
}

// ── Custom registries and externals ─────────────────────────────────

#[test]
fn externals_feed_custom_element_types() {
    let mut registry = Registry::standard();
    registry.register(
        ElementType::new("clock").primary("time").variable(StateVarSpec::derived(
            "time",
            Derivation::new(|deps| deps.value("now").cloned().unwrap_or_default())
                .depends_on("now", Dependency::External("now".into())),
        )),
    );
    let document = Document::new(vec![
        ElementDecl::new("clock").named("clock"),
        ElementDecl::new("point").named("P").bind("x", "$clock"),
    ]);
    let mut engine = Engine::with_registry(&document, registry, EngineConfig::default()).unwrap();
    assert_eq!(coords(&engine, "P"), Value::List(vec![Value::Undefined, Value::Number(0.0)]));

    let outcome = engine.set_external("now", Value::Number(12.0));
    let p = engine.key("P", "coords").unwrap();
    assert_eq!(outcome.changed.get(&p), Some(&Value::numbers([12.0, 0.0])));

    // No inverse: dragging x is refused, y still moves.
    let outcome = drag(&mut engine, "P", 1.0, 1.0);
    assert!(refused(&outcome, Refusal::NotInvertible));
    assert_eq!(coords(&engine, "P"), Value::numbers([12.0, 1.0]));
}

#[test]
fn refused_branches_leave_the_essential_store_untouched() {
    // `lockstep` moves every term at once or none of them.
    let mut registry = Registry::standard();
    registry.register(
        ElementType::new("lockstep").primary("value").variable(StateVarSpec::derived(
            "value",
            Derivation::new(|deps| Value::List(deps.members("terms").to_vec()))
                .depends_on("terms", Dependency::attribute("terms"))
                .invert_with(|desired, _| InverseResult::set("terms", desired.clone())),
        )),
    );
    let document = Document::new(vec![
        ElementDecl::new("number").named("a").with("value", 1.0),
        ElementDecl::new("lockstep").named("L").attr(
            "terms",
            Attribute::List(vec![Attribute::reference("a", None), Attribute::literal(9.0)]),
        ),
    ]);
    let mut engine = Engine::with_registry(&document, registry, EngineConfig::default()).unwrap();
    let a = engine.element_named("a").unwrap();
    let path = engine.element(a).unwrap().path.clone();
    assert_eq!(engine.essential(&path, "value"), None);

    let l = engine.key("L", "value").unwrap();
    let outcome = engine
        .apply_action(Action::settled(l, Value::numbers([5.0, 8.0])))
        .unwrap();
    assert!(!outcome.accepted);
    assert!(refused(&outcome, Refusal::Fixed));
    assert_eq!(engine.value(&engine.key("a", "value").unwrap()), Some(&Value::Number(1.0)));
    assert_eq!(engine.essential(&path, "value"), None);
    assert_eq!(engine.history_len(), 0);

    // A value that was stored before the refusal is put back as it was.
    set_number(&mut engine, "a", 3.0);
    let l = engine.key("L", "value").unwrap();
    engine
        .apply_action(Action::settled(l, Value::numbers([5.0, 8.0])))
        .unwrap();
    assert_eq!(engine.essential(&path, "value"), Some(&Value::Number(3.0)));
}

#[test]
fn documents_load_from_json() {
    let document = Document::from_json(
        r#"{
            "children": [
                { "type": "point", "name": "P1", "attributes": { "x": 1, "y": 2 } },
                { "type": "point", "name": "P2", "attributes": { "x": "$P1.y", "y": "$P1.x" } }
            ]
        }"#,
    )
    .unwrap();
    let engine = Engine::new(&document).unwrap();
    assert_eq!(coords(&engine, "P2"), Value::numbers([2.0, 1.0]));
}
