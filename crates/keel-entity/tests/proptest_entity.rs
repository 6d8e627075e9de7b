//! Property tests for the entity context.
//!
//! Random sequences of structural operations are applied and the core
//! invariants re-checked after every step: stale handles stay dead, every
//! live entity sits in exactly one archetype, and component payloads
//! survive migrations.

use std::collections::HashMap;
use std::sync::Arc;

use keel_entity::prelude::*;
use keel_truth::store::Truth;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum ContextOp {
    SpawnA(u8),
    SpawnAb(u8, u8),
    Destroy(usize),
    AddB(usize, u8),
    RemoveB(usize),
    DestroyStale,
}

fn op_strategy() -> impl Strategy<Value = ContextOp> {
    prop_oneof![
        any::<u8>().prop_map(ContextOp::SpawnA),
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| ContextOp::SpawnAb(a, b)),
        (0..64usize).prop_map(ContextOp::Destroy),
        (0..64usize, any::<u8>()).prop_map(|(i, v)| ContextOp::AddB(i, v)),
        (0..64usize).prop_map(ContextOp::RemoveB),
        Just(ContextOp::DestroyStale),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn random_structural_ops_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut ctx = EntityContext::new(Arc::new(Truth::new()));
        let a = ctx.register_component(ComponentDesc::new("a", 1));
        let b = ctx.register_component(ComponentDesc::new("b", 1));
        let mask_a = ComponentMask::EMPTY.with(a);
        let mask_ab = ComponentMask::EMPTY.with(a).with(b);

        let mut alive: Vec<Entity> = Vec::new();
        let mut dead: Vec<Entity> = Vec::new();
        // Expected payload of component a per entity.
        let mut payload_a: HashMap<Entity, u8> = HashMap::new();

        for op in ops {
            match op {
                ContextOp::SpawnA(v) => {
                    let e = ctx.create_entity_from_mask(&mask_a).unwrap();
                    ctx.get_component_mut(e, a).unwrap()[0] = v;
                    payload_a.insert(e, v);
                    alive.push(e);
                }
                ContextOp::SpawnAb(va, vb) => {
                    let e = ctx.create_entity_from_mask(&mask_ab).unwrap();
                    ctx.get_component_mut(e, a).unwrap()[0] = va;
                    ctx.get_component_mut(e, b).unwrap()[0] = vb;
                    payload_a.insert(e, va);
                    alive.push(e);
                }
                ContextOp::Destroy(i) => {
                    if !alive.is_empty() {
                        let e = alive.remove(i % alive.len());
                        ctx.destroy_entity(e);
                        payload_a.remove(&e);
                        dead.push(e);
                    }
                }
                ContextOp::AddB(i, v) => {
                    if !alive.is_empty() {
                        let e = alive[i % alive.len()];
                        ctx.add_component(e, b).unwrap()[0] = v;
                    }
                }
                ContextOp::RemoveB(i) => {
                    if !alive.is_empty() {
                        let e = alive[i % alive.len()];
                        ctx.remove_component(e, b).unwrap();
                    }
                }
                ContextOp::DestroyStale => {
                    // Destroying stale handles never panics or revives.
                    if let Some(&e) = dead.first() {
                        ctx.destroy_entity(e);
                    }
                }
            }

            // Stale handles stay dead.
            for &e in &dead {
                prop_assert!(!ctx.is_alive(e));
            }
            prop_assert_eq!(ctx.entity_count(), alive.len());

            // Every live entity appears in exactly one archetype.
            let mut seen: HashMap<Entity, usize> = HashMap::new();
            for m in ctx.entities_matching(&ComponentMask::EMPTY, None) {
                for &e in m.entities {
                    *seen.entry(e).or_insert(0) += 1;
                }
            }
            for &e in &alive {
                prop_assert_eq!(seen.get(&e).copied().unwrap_or(0), 1);
            }

            // Component-a payloads survive every migration.
            for (&e, &expected) in &payload_a {
                prop_assert_eq!(ctx.get_component(e, a).unwrap()[0], expected);
            }
        }
    }
}
