//! Entity runtime benchmarks: spawning, archetype migration, and a
//! scheduled engine update over a large population.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keel_entity::prelude::*;
use keel_truth::store::Truth;

fn context() -> (EntityContext, ComponentIndex, ComponentIndex) {
    let mut ctx = EntityContext::new(Arc::new(Truth::new()));
    let position = ctx.register_component(ComponentDesc::new("position", 16));
    let velocity = ctx.register_component(ComponentDesc::new("velocity", 16));
    (ctx, position, velocity)
}

fn bench_spawn(c: &mut Criterion) {
    c.bench_function("spawn_1k_two_components", |b| {
        b.iter(|| {
            let (mut ctx, position, velocity) = context();
            let mask = ComponentMask::EMPTY.with(position).with(velocity);
            black_box(ctx.create_entities_from_mask(&mask, 1000).unwrap());
        })
    });
}

fn bench_migration(c: &mut Criterion) {
    c.bench_function("add_remove_component_roundtrip", |b| {
        let (mut ctx, position, velocity) = context();
        let e = ctx
            .create_entity_from_mask(&ComponentMask::EMPTY.with(position))
            .unwrap();
        b.iter(|| {
            ctx.add_component(e, velocity).unwrap();
            ctx.remove_component(e, velocity).unwrap();
        })
    });
}

fn bench_engine_update(c: &mut Criterion) {
    let (mut ctx, position, velocity) = context();
    let mask = ComponentMask::EMPTY.with(position).with(velocity);
    ctx.create_entities_from_mask(&mask, 10_000).unwrap();

    ctx.register_engine(EngineDesc::new(
        "integrate",
        vec![position, velocity],
        vec![true, false],
        Arc::new(|update: &mut EngineUpdate<'_>| {
            for array in &mut update.arrays {
                for row in 0..array.count() {
                    let v = array.column::<[f32; 4]>(1)[row];
                    let p = &mut array.column_mut::<[f32; 4]>(0)[row];
                    p[0] += v[0];
                    p[1] += v[1];
                }
            }
        }),
    ));

    c.bench_function("update_10k_entities_serial", |b| {
        b.iter(|| ctx.update(&SerialJobSystem))
    });
}

criterion_group!(benches, bench_spawn, bench_migration, bench_engine_update);
criterion_main!(benches);
