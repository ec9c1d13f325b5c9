//! Criterion benchmarks for action throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trellis_core::{Action, Document, ElementDecl, Engine, Value};

/// A chain of `len` points, each mirroring the previous one.
fn chain(len: usize) -> Document {
    let mut children = vec![ElementDecl::new("point").named("P0").with("x", 0.0).with("y", 0.0)];
    for i in 1..len {
        let prev = format!("$P{}", i - 1);
        children.push(
            ElementDecl::new("point")
                .named(format!("P{i}"))
                .bind("x", &format!("{prev}.y"))
                .bind("y", &format!("{prev}.x")),
        );
    }
    Document::new(children)
}

fn repeated(n: f64) -> Document {
    Document::new(vec![
        ElementDecl::new("number").named("n").with("value", n),
        ElementDecl::new("repeat")
            .named("R")
            .bind("count", "$n")
            .with("valueName", "v")
            .child(ElementDecl::new("point").bind("x", "$v")),
    ])
}

fn bench_drag_chain(c: &mut Criterion) {
    let mut engine = Engine::new(&chain(200)).unwrap();
    let head = engine.key("P0", "coords").unwrap();
    let mut step = 0.0;
    c.bench_function("drag_chain_200", |b| {
        b.iter(|| {
            step += 1.0;
            let action = Action::settled(head.clone(), Value::numbers([step, -step]));
            black_box(engine.apply_action(action).unwrap());
        });
    });
}

fn bench_transient_drag(c: &mut Criterion) {
    let mut engine = Engine::new(&chain(200)).unwrap();
    let tail = engine.key("P199", "coords").unwrap();
    let mut step = 0.0;
    c.bench_function("transient_drag_chain_200", |b| {
        b.iter(|| {
            step += 1.0;
            let action = Action::transient(tail.clone(), Value::numbers([step, step]));
            black_box(engine.apply_action(action).unwrap());
        });
    });
}

fn bench_resize_repeat(c: &mut Criterion) {
    let mut engine = Engine::new(&repeated(100.0)).unwrap();
    let n = engine.key("n", "value").unwrap();
    let mut grow = false;
    c.bench_function("resize_repeat_50_100", |b| {
        b.iter(|| {
            grow = !grow;
            let count = if grow { 100.0 } else { 50.0 };
            let action = Action::settled(n.clone(), Value::Number(count));
            black_box(engine.apply_action(action).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_drag_chain,
    bench_transient_drag,
    bench_resize_repeat
);
criterion_main!(benches);
